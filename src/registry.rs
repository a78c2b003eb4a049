use crate::analyzer::Analyzer;

/// Collects analyzers during startup. Only `push` is offered; once `finish`
/// is called the set is frozen.
#[derive(Default)]
pub struct RegistryBuilder {
    analyzers: Vec<Box<dyn Analyzer>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push(&mut self, analyzer: Box<dyn Analyzer>) {
        self.analyzers.push(analyzer);
    }

    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }

    pub fn finish(self) -> AnalyzerRegistry {
        AnalyzerRegistry {
            analyzers: self.analyzers,
        }
    }
}

/// The fixed set of analyzers every connection is dispatched against.
///
/// Read-only after construction; share it between workers with an `Arc`.
/// Iteration order is the order analyzers were pushed.
pub struct AnalyzerRegistry {
    analyzers: Vec<Box<dyn Analyzer>>,
}

impl AnalyzerRegistry {
    pub fn iter(&self) -> impl Iterator<Item = &dyn Analyzer> {
        self.analyzers.iter().map(|a| a.as_ref())
    }

    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.iter().map(|a| a.name()).collect()
    }
}
