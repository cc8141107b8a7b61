//! Decoding of the `transfer_record` returned by the provisioning plugin.
//!
//! The record is a tiny XML document whose single `transfer_record` element
//! carries the connection details as attributes:
//!
//! ```xml
//! <transfer_record ip="10.0.0.5" port="3260" isci_lun="iqn.2026-10.local:vdi"
//!                  username="user" password="secret" iscsi_lun="1"
//!                  record_handle="r-1234"/>
//! ```
//!
//! `isci_lun` is the target group tag, not a LUN. The numeric LUN index, when
//! the endpoint publishes one, lives in `iscsi_lun`.

use quick_xml::events::Event;
use quick_xml::events::attributes::Attributes;
use quick_xml::Reader;

use crate::error::{Result, TransferError};

/// Element that carries the connection attributes.
pub const RECORD_TAG: &str = "transfer_record";

const DEFAULT_ISCSI_PORT: u16 = 3260;

/// Return the value of `key` on the first `transfer_record` element.
///
/// The record must be a well-formed document with a single root element.
/// Unclosed or mismatched elements, a second root and text outside the root
/// are reported as [`TransferError::RecordParse`] rather than "attribute
/// absent".
pub fn parse(record: &str, key: &str) -> Result<Option<String>> {
    if record.trim().is_empty() {
        return Err(TransferError::RecordParse("record is empty".to_string()));
    }

    let mut reader = Reader::from_str(record);
    let mut found: Option<Option<String>> = None;
    let mut open: Vec<Vec<u8>> = Vec::new();
    let mut roots = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| {
            TransferError::RecordParse(format!("at byte {}: {}", reader.error_position(), e))
        })?;

        match &event {
            Event::Start(element) | Event::Empty(element) => {
                if open.is_empty() {
                    roots += 1;
                    if roots > 1 {
                        return Err(malformed(&reader, "more than one root element"));
                    }
                }
                if found.is_none() && element.name().as_ref() == RECORD_TAG.as_bytes() {
                    found = Some(attribute_value(element.attributes(), key)?);
                }
                if matches!(event, Event::Start(_)) {
                    open.push(element.name().as_ref().to_vec());
                }
            }
            Event::End(element) => match open.pop() {
                Some(name) if name == element.name().as_ref() => {}
                _ => return Err(malformed(&reader, "unexpected closing tag")),
            },
            Event::Text(text) if open.is_empty() => {
                if !text.iter().all(u8::is_ascii_whitespace) {
                    return Err(malformed(&reader, "text outside the root element"));
                }
            }
            Event::CData(_) if open.is_empty() => {
                return Err(malformed(&reader, "CDATA outside the root element"));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(name) = open.last() {
        return Err(TransferError::RecordParse(format!(
            "element '{}' is not closed",
            String::from_utf8_lossy(name)
        )));
    }
    if roots == 0 {
        return Err(TransferError::RecordParse("no root element".to_string()));
    }

    Ok(found.flatten())
}

fn malformed(reader: &Reader<&[u8]>, reason: &str) -> TransferError {
    TransferError::RecordParse(format!("at byte {}: {}", reader.buffer_position(), reason))
}

fn attribute_value(attributes: Attributes<'_>, key: &str) -> Result<Option<String>> {
    let mut value = None;
    for attribute in attributes {
        let attribute = attribute.map_err(|e| TransferError::RecordParse(e.to_string()))?;
        if value.is_none() && attribute.key.as_ref() == key.as_bytes() {
            let decoded = attribute
                .unescape_value()
                .map_err(|e| TransferError::RecordParse(e.to_string()))?;
            value = Some(decoded.into_owned());
        }
    }
    Ok(value)
}

/// Typed view of a provisioning record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub ip: String,
    pub port: u16,
    pub target_group_tag: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub lun_index: Option<u64>,
    pub record_handle: Option<String>,
}

impl ConnectionParameters {
    /// Build connection parameters from a raw record.
    ///
    /// Fails with [`TransferError::Connection`] when the record has no IP
    /// address or an unusable port or LUN index.
    pub fn from_record(record: &str) -> Result<Self> {
        let field = |key: &str| -> Result<Option<String>> {
            Ok(parse(record, key)?.filter(|v| !v.trim().is_empty()))
        };

        let ip = field("ip")?.ok_or_else(|| {
            TransferError::Connection("transfer record has no IP address".to_string())
        })?;

        let port = match field("port")? {
            Some(port) => port.trim().parse::<u16>().map_err(|_| {
                TransferError::Connection(format!("invalid port '{}' in transfer record", port))
            })?,
            None => DEFAULT_ISCSI_PORT,
        };

        let lun_index = match field("iscsi_lun")? {
            Some(index) => Some(index.trim().parse::<u64>().map_err(|_| {
                TransferError::Connection(format!("invalid LUN index '{}' in transfer record", index))
            })?),
            None => None,
        };

        Ok(Self {
            ip,
            port,
            target_group_tag: field("isci_lun")?.unwrap_or_default(),
            username: field("username")?,
            password: field("password")?,
            lun_index,
            record_handle: field("record_handle")?,
        })
    }

    /// Username and password, only when both are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }
}
