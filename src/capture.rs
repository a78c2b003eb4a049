use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use pcap::{Active, Capture, Device, Error};

/// Which capture backend the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Libpcap,
    /// Still opened through libpcap (which uses AF_PACKET rings on Linux),
    /// but in immediate mode with a larger kernel buffer.
    Afpacket,
}

/// Validated capture parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    pub interface: String,
    pub interface_type: InterfaceType,
    pub promiscuous: bool,
    pub snap_len: u32,
    pub bpf: String,
}

/// A captured frame and the time the kernel saw it.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
}

const READ_TIMEOUT_MS: i32 = 1000;
const AFPACKET_BUFFER_BYTES: i32 = 32 * 1024 * 1024;

pub fn open_capture(opts: &CaptureOptions) -> Result<Capture<Active>, Error> {
    let mut inactive = Capture::from_device(opts.interface.as_str())?
        .promisc(opts.promiscuous)
        .snaplen(pcap_snaplen(opts.snap_len))
        .timeout(READ_TIMEOUT_MS);

    if opts.interface_type == InterfaceType::Afpacket {
        inactive = inactive
            .immediate_mode(true)
            .buffer_size(AFPACKET_BUFFER_BYTES);
    }

    let mut cap = inactive.open()?;
    if !opts.bpf.is_empty() {
        cap.filter(&opts.bpf, true)?;
        info!("Applied BPF filter '{}'", opts.bpf);
    }
    Ok(cap)
}

/// Reads packets until the receiving side hangs up or the capture fails.
pub fn start_capture(mut cap: Capture<Active>, tx: Sender<RawPacket>) -> Result<(), Error> {
    loop {
        let packet = match cap.next_packet() {
            Ok(packet) => packet,
            // Quiet interface; keep waiting.
            Err(Error::TimeoutExpired) => continue,
            Err(e) => return Err(e),
        };

        let raw = RawPacket {
            timestamp: packet_time(packet.header.ts.tv_sec as i64, packet.header.ts.tv_usec as i64),
            data: packet.data.to_vec(),
        };
        if tx.send(raw).is_err() {
            info!("Channel closed, shutting down capture thread.");
            return Ok(());
        }
    }
}

// libpcap takes the snapshot length as a C int, so configured values above
// i32::MAX are capped there.
fn pcap_snaplen(snap_len: u32) -> i32 {
    i32::try_from(snap_len).unwrap_or_else(|_| {
        warn!(
            "Snapshot length {} exceeds what libpcap accepts, using {}",
            snap_len,
            i32::MAX
        );
        i32::MAX
    })
}

fn packet_time(secs: i64, usecs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, (usecs * 1000) as u32).unwrap_or_else(|| {
        debug!("Packet timestamp {}.{} out of range, using now", secs, usecs);
        Utc::now()
    })
}

/// Names of every device libpcap can capture on.
pub fn list_devices() -> Result<Vec<String>, Error> {
    Ok(Device::list()?.into_iter().map(|d| d.name).collect())
}
