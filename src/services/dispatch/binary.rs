use crate::config::BinarySinkConfig;
use crate::error::AppError;
use crate::models::classify_types::LabelResult;
use crate::models::wire_types::{Index, IndexEntry, Packet, PacketHeader};
use crate::services::dispatch::Dispatcher;
use prost::Message;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info};

/// One entry per prediction, indexed by its position in the labeler output.
pub fn build_index(result: &LabelResult) -> Index {
    let path = result.image_str();
    let entry = result
        .predictions()
        .iter()
        .enumerate()
        .map(|(pos, prediction)| IndexEntry {
            path: path.clone(),
            index: pos as u32,
            key: prediction.class_name.clone(),
            probability: prediction.confidence,
        })
        .collect();
    Index { entry }
}

pub fn build_packet(result: &LabelResult) -> Result<Packet, AppError> {
    let payload = build_index(result);
    let payload_len = u32::try_from(payload.encoded_len())
        .map_err(|_| AppError::from("payload does not fit a 32-bit length"))?;
    Ok(Packet {
        header: Some(PacketHeader {
            payload: payload_len,
        }),
        payload: Some(payload),
    })
}

/// Encodes a result as a length-delimited packet.
///
/// The header is stamped only after the payload is complete. Stamping it
/// widens the header by the varint size of the length, so the outer
/// delimiter is computed from the stamped packet.
pub fn encode_frame(result: &LabelResult) -> Result<Vec<u8>, AppError> {
    let packet = build_packet(result)?;
    Ok(packet.encode_length_delimited_to_vec())
}

/// Decodes one frame produced by [`encode_frame`] and checks its header.
pub fn decode_frame(frame: &[u8]) -> Result<Packet, AppError> {
    let packet = Packet::decode_length_delimited(frame)?;
    verify(&packet)?;
    Ok(packet)
}

/// Reads the next frame from a stream. `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Packet>, AppError> {
    let mut delimiter = Vec::with_capacity(10);
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte)? {
            0 if delimiter.is_empty() => return Ok(None),
            0 => return Err(AppError::Decode("stream ended inside a length prefix".into())),
            _ => {}
        }
        delimiter.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            break;
        }
        if delimiter.len() == 10 {
            return Err(AppError::Decode("length prefix too long".into()));
        }
    }

    let len = prost::decode_length_delimiter(delimiter.as_slice())?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let packet = Packet::decode(body.as_slice())?;
    verify(&packet)?;
    Ok(Some(packet))
}

fn verify(packet: &Packet) -> Result<(), AppError> {
    let header = packet
        .header
        .as_ref()
        .ok_or_else(|| AppError::Decode("packet has no header".into()))?;
    let payload = packet
        .payload
        .as_ref()
        .ok_or_else(|| AppError::Decode("packet has no payload".into()))?;
    let actual = payload.encoded_len();
    if header.payload as usize != actual {
        return Err(AppError::Decode(format!(
            "header announces {} payload bytes, found {}",
            header.payload, actual
        )));
    }
    Ok(())
}

/// Sends packets over one long-lived TCP connection made at startup.
/// A failed connect or send is reported and never retried.
pub struct BinaryDispatcher {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

impl BinaryDispatcher {
    pub fn connect(config: &BinarySinkConfig) -> Self {
        let addr = format!("{}:{}", config.host, config.port);
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = match open_stream(&config.host, config.port, timeout) {
            Ok(stream) => {
                info!(%addr, "Success connecting to server");
                Some(stream)
            }
            Err(e) => {
                error!(%addr, "Error connecting to server: {}", e);
                None
            }
        };
        Self {
            addr,
            stream: Mutex::new(stream),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}

fn open_stream(host: &str, port: u16, timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

impl Dispatcher for BinaryDispatcher {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn dispatch(&self, result: LabelResult) -> Result<(), AppError> {
        for prediction in result.predictions() {
            debug!(
                "{} ({}): {}",
                result.image.display(),
                prediction.class_name,
                prediction.confidence
            );
        }

        let frame = encode_frame(&result)?;
        let mut guard = self.stream.lock().unwrap_or_else(|p| p.into_inner());
        let stream = guard
            .as_mut()
            .ok_or_else(|| AppError::NotConnected(self.addr.clone()))?;
        if let Err(e) = stream.write_all(&frame) {
            error!(
                addr = %self.addr,
                path = %result.image.display(),
                "Error sending to server: {}",
                e
            );
            // A partial frame would misframe everything after it.
            *guard = None;
            return Err(e.into());
        }
        info!(
            path = %result.image.display(),
            entries = result.len(),
            bytes = frame.len(),
            "Success sending to server"
        );
        Ok(())
    }
}
