//! Minimal analyzer plugin. Publish a crate like this in a git repository and
//! list its path (without `https://`) under `analyzers:` in the sensor config.

use nids_v2::{Analyzer, AnalyzerError, AnalyzerResult, Connection, Severity};

const LARGE_PAYLOAD: usize = 1024 * 1024;

pub struct PayloadSize;

impl Analyzer for PayloadSize {
    fn name(&self) -> &str {
        "payload-size"
    }

    fn filter(&self, _conn: &Connection) -> bool {
        true
    }

    fn analyze(&self, conn: &mut Connection) -> Result<AnalyzerResult, AnalyzerError> {
        let len = conn.payload().len();
        if len > LARGE_PAYLOAD {
            return Ok(AnalyzerResult::alert(
                "payload_size",
                Severity::Medium,
                format!("{} bytes exchanged with {}", len, conn.destination()),
            ));
        }
        Ok(AnalyzerResult::data("payload_size", serde_json::json!(len)))
    }
}

fn new_analyzer() -> PayloadSize {
    PayloadSize
}

nids_v2::declare_analyzer!(new_analyzer);
