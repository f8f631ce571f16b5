//! Inbound messages
//!
//! Turns the byte stream coming from the board into typed messages. Parsing
//! is a closed match over the command byte; anything unrecognised ends up in
//! an explicit `Unknown` variant or is skipped by the reader.

use super::codec::{decode_pairs, from_7bit};
use super::commands::*;
use super::ProtocolError;
use crate::transport::Transport;

/// One block reported by a Pixy camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixyBlock {
    pub signature: u16,
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub angle: u16,
}

/// Encoder payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderReport {
    /// Signed position of a single quadrature encoder
    Position { pin: u8, value: i32 },
    /// Two hall-effect wheel counters
    Hall { pin: u8, counts: [u16; 2] },
}

/// A decoded sysex message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysexMessage {
    Firmware { major: u8, minor: u8, name: String },
    CapabilityResponse(Vec<u8>),
    AnalogMappingResponse(Vec<u8>),
    PinStateResponse(Vec<u8>),
    StringData(String),
    I2cReply { address: u16, words: Vec<u16> },
    SonarData { pin: u8, distance: u16 },
    EncoderData(Vec<u8>),
    PixyData(Vec<PixyBlock>),
    Unknown { command: u8, payload: Vec<u8> },
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// REPORT_VERSION (0xF9) with its two trailing bytes
    ProtocolVersion { major: u8, minor: u8 },
    /// Short-form analog value; `channel` is the analog channel number
    Analog { channel: u8, value: u16 },
    /// Short-form digital port value, one bit per pin
    Digital { port: u8, value: u16 },
    Sysex(SysexMessage),
}

impl SysexMessage {
    /// Decode a sysex body (command byte followed by payload, no framing)
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let (&command, payload) = body
            .split_first()
            .ok_or_else(|| ProtocolError::Malformed("empty sysex".to_string()))?;

        let message = match command {
            REPORT_FIRMWARE => {
                if payload.len() < 2 {
                    return Err(ProtocolError::Malformed("short firmware report".to_string()));
                }
                let name = decode_pairs(&payload[2..])
                    .into_iter()
                    .filter(|c| *c != 0)
                    .filter_map(|c| char::from_u32(c as u32))
                    .collect();
                SysexMessage::Firmware {
                    major: payload[0],
                    minor: payload[1],
                    name,
                }
            }
            CAPABILITY_RESPONSE => SysexMessage::CapabilityResponse(payload.to_vec()),
            ANALOG_MAPPING_RESPONSE => SysexMessage::AnalogMappingResponse(payload.to_vec()),
            PIN_STATE_RESPONSE => SysexMessage::PinStateResponse(payload.to_vec()),
            STRING_DATA => SysexMessage::StringData(
                decode_pairs(payload)
                    .into_iter()
                    .filter(|c| *c != 0)
                    .filter_map(|c| char::from_u32(c as u32))
                    .collect(),
            ),
            I2C_REPLY => {
                let words = decode_pairs(payload);
                let address = *words
                    .first()
                    .ok_or_else(|| ProtocolError::Malformed("empty i2c reply".to_string()))?;
                SysexMessage::I2cReply { address, words }
            }
            SONAR_DATA => {
                if payload.len() < 3 {
                    return Err(ProtocolError::Malformed("short sonar data".to_string()));
                }
                SysexMessage::SonarData {
                    pin: payload[0],
                    distance: from_7bit(&payload[1..3]) as u16,
                }
            }
            ENCODER_DATA => SysexMessage::EncoderData(payload.to_vec()),
            PIXY_DATA => SysexMessage::PixyData(parse_pixy_blocks(payload)?),
            _ => SysexMessage::Unknown {
                command,
                payload: payload.to_vec(),
            },
        };
        Ok(message)
    }
}

/// Decode encoder payload; hall mode carries two counters
pub fn parse_encoder(payload: &[u8], hall: bool) -> Result<EncoderReport, ProtocolError> {
    let short = || ProtocolError::Malformed("short encoder data".to_string());
    let pin = *payload.first().ok_or_else(short)?;
    if hall {
        if payload.len() < 6 {
            return Err(short());
        }
        Ok(EncoderReport::Hall {
            pin,
            counts: [
                from_7bit(&payload[1..3]) as u16,
                from_7bit(&payload[4..6]) as u16,
            ],
        })
    } else {
        if payload.len() < 3 {
            return Err(short());
        }
        let mut value = from_7bit(&payload[1..3]) as i32;
        if value > 8192 {
            value -= 16384;
        }
        Ok(EncoderReport::Position { pin, value })
    }
}

fn parse_pixy_blocks(payload: &[u8]) -> Result<Vec<PixyBlock>, ProtocolError> {
    let count = *payload
        .first()
        .ok_or_else(|| ProtocolError::Malformed("empty pixy data".to_string()))? as usize;
    let data = &payload[1..];
    if data.len() < count * 12 {
        return Err(ProtocolError::Malformed(format!(
            "pixy data announced {} blocks but carries {} bytes",
            count,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(12)
        .take(count)
        .map(|chunk| {
            let w = decode_pairs(chunk);
            PixyBlock {
                signature: w[0],
                x: w[1],
                y: w[2],
                width: w[3],
                height: w[4],
                angle: w[5],
            }
        })
        .collect())
}

/// Longest sysex body kept; larger frames are discarded
pub const MAX_SYSEX_LEN: usize = 4096;

/// How a sysex body ended
enum SysexBody {
    Complete(Vec<u8>),
    /// Too long; everything up to END_SYSEX was skipped
    Overlong(usize),
    /// A status byte arrived before END_SYSEX
    Interrupted(u8),
}

/// Collect sysex data bytes after START_SYSEX. A repeated START_SYSEX begins
/// a fresh body.
async fn read_sysex_body(transport: &dyn Transport) -> Result<SysexBody, ProtocolError> {
    let mut body = Vec::new();
    let mut skipped = 0usize;
    loop {
        let byte = transport.read_byte().await?;
        match byte {
            END_SYSEX if skipped > 0 => return Ok(SysexBody::Overlong(skipped + body.len())),
            END_SYSEX => return Ok(SysexBody::Complete(body)),
            START_SYSEX => {
                tracing::debug!("sysex restarted after {} bytes", body.len() + skipped);
                body.clear();
                skipped = 0;
            }
            b if b & 0x80 != 0 => return Ok(SysexBody::Interrupted(b)),
            _ if skipped > 0 || body.len() >= MAX_SYSEX_LEN => {
                skipped += 1;
            }
            b => body.push(b),
        }
    }
}

/// Read the next complete message from a transport.
///
/// Returns `Ok(None)` for bytes that do not start any known message; the
/// caller simply keeps reading. A sysex frame cut short by another status
/// byte is abandoned and that byte starts the next message.
pub async fn read_message(transport: &dyn Transport) -> Result<Option<Message>, ProtocolError> {
    let mut first = transport.read_byte().await?;
    while first == START_SYSEX {
        match read_sysex_body(transport).await? {
            SysexBody::Complete(body) => {
                return match SysexMessage::parse(&body) {
                    Ok(sysex) => Ok(Some(Message::Sysex(sysex))),
                    Err(e) => {
                        tracing::warn!("dropping sysex frame: {e}");
                        Ok(None)
                    }
                };
            }
            SysexBody::Overlong(len) => {
                tracing::warn!("dropping sysex frame of {} bytes", len);
                return Ok(None);
            }
            SysexBody::Interrupted(status) => {
                tracing::warn!("sysex frame interrupted by 0x{:02X}", status);
                first = status;
            }
        }
    }
    match first {
        ANALOG_MESSAGE..=ANALOG_MESSAGE_END => {
            let lsb = transport.read_byte().await?;
            let msb = transport.read_byte().await?;
            Ok(Some(Message::Analog {
                channel: first & 0x0F,
                value: from_7bit(&[lsb, msb]) as u16,
            }))
        }
        DIGITAL_MESSAGE..=DIGITAL_MESSAGE_END => {
            let lsb = transport.read_byte().await?;
            let msb = transport.read_byte().await?;
            Ok(Some(Message::Digital {
                port: first & 0x0F,
                value: from_7bit(&[lsb, msb]) as u16,
            }))
        }
        REPORT_VERSION => {
            let major = transport.read_byte().await?;
            let minor = transport.read_byte().await?;
            Ok(Some(Message::ProtocolVersion { major, minor }))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::SysexBuilder;
    use crate::transport::LoopbackTransport;

    #[test]
    fn test_parse_firmware() {
        let mut body = vec![REPORT_FIRMWARE, 2, 5];
        for c in "Std".chars() {
            body.extend_from_slice(&[c as u8 & 0x7F, 0]);
        }
        let msg = SysexMessage::parse(&body).unwrap();
        assert_eq!(
            msg,
            SysexMessage::Firmware {
                major: 2,
                minor: 5,
                name: "Std".to_string()
            }
        );
    }

    #[test]
    fn test_parse_unknown_sysex() {
        let msg = SysexMessage::parse(&[0x01, 0x02]).unwrap();
        assert_eq!(
            msg,
            SysexMessage::Unknown {
                command: 0x01,
                payload: vec![0x02]
            }
        );
        assert!(SysexMessage::parse(&[]).is_err());
    }

    #[test]
    fn test_parse_encoder() {
        assert_eq!(
            parse_encoder(&[2, 0x7F, 0x7F], false).unwrap(),
            EncoderReport::Position { pin: 2, value: -1 }
        );
        assert_eq!(
            parse_encoder(&[2, 5, 0], false).unwrap(),
            EncoderReport::Position { pin: 2, value: 5 }
        );
        assert_eq!(
            parse_encoder(&[2, 1, 0, 0, 3, 0], true).unwrap(),
            EncoderReport::Hall { pin: 2, counts: [1, 3] }
        );
    }

    #[test]
    fn test_parse_pixy() {
        let mut payload = vec![1];
        for v in [1u32, 100, 50, 10, 20, 0] {
            payload.extend(crate::protocol::codec::to_7bit(v, 2));
        }
        let msg = SysexMessage::parse(&[&[PIXY_DATA][..], &payload].concat()).unwrap();
        assert_eq!(
            msg,
            SysexMessage::PixyData(vec![PixyBlock {
                signature: 1,
                x: 100,
                y: 50,
                width: 10,
                height: 20,
                angle: 0
            }])
        );
    }

    #[tokio::test]
    async fn test_read_stream() {
        let transport = LoopbackTransport::new("loop");
        transport.push_inbound(&[0x42]); // noise
        transport.push_inbound(&[0xE1, 0x7F, 0x07]);
        transport.push_inbound(&[0x91, 0x05, 0x00]);
        transport.push_inbound(&[REPORT_VERSION, 2, 5]);
        transport.push_inbound(&SysexBuilder::new(SONAR_DATA).byte(7).seven_bit(200, 2).build());

        assert_eq!(read_message(&transport).await.unwrap(), None);
        assert_eq!(
            read_message(&transport).await.unwrap(),
            Some(Message::Analog { channel: 1, value: 1023 })
        );
        assert_eq!(
            read_message(&transport).await.unwrap(),
            Some(Message::Digital { port: 1, value: 5 })
        );
        assert_eq!(
            read_message(&transport).await.unwrap(),
            Some(Message::ProtocolVersion { major: 2, minor: 5 })
        );
        assert_eq!(
            read_message(&transport).await.unwrap(),
            Some(Message::Sysex(SysexMessage::SonarData { pin: 7, distance: 200 }))
        );
    }

    #[tokio::test]
    async fn test_lost_end_of_sysex() {
        let transport = LoopbackTransport::new("loop");
        // Firmware reply missing its END_SYSEX, then an analog reading
        transport.push_inbound(&[START_SYSEX, REPORT_FIRMWARE, 2, 5]);
        transport.push_inbound(&[0xE0, 0x10, 0x01]);
        // A frame restarted midway keeps only the second body
        transport.push_inbound(&[START_SYSEX, SONAR_DATA, 3]);
        transport.push_inbound(&SysexBuilder::new(SONAR_DATA).byte(7).seven_bit(200, 2).build());

        assert_eq!(
            read_message(&transport).await.unwrap(),
            Some(Message::Analog { channel: 0, value: 144 })
        );
        assert_eq!(
            read_message(&transport).await.unwrap(),
            Some(Message::Sysex(SysexMessage::SonarData { pin: 7, distance: 200 }))
        );
    }

    #[tokio::test]
    async fn test_overlong_sysex_dropped() {
        let transport = LoopbackTransport::new("loop");
        transport.push_inbound(&[START_SYSEX, STRING_DATA]);
        transport.push_inbound(&vec![0x41; MAX_SYSEX_LEN + 10]);
        transport.push_inbound(&[END_SYSEX, REPORT_VERSION, 2, 5]);

        assert_eq!(read_message(&transport).await.unwrap(), None);
        assert_eq!(
            read_message(&transport).await.unwrap(),
            Some(Message::ProtocolVersion { major: 2, minor: 5 })
        );
    }
}
