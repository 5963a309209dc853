//! TLS ClientHello sniffing
//!
//! Reads exactly one handshake record off the raw TCP stream and hand-parses
//! the ClientHello for the server name (SNI, extension 0x0000) and the ALPN
//! list (extension 0x0010). The consumed bytes are returned alongside the
//! parse result so the caller can replay them to the backend verbatim; the
//! stream itself is left positioned right after the record.

use crate::RelayError;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Upper bound on a plausible ClientHello record
const MAX_HELLO_SIZE: usize = 16 * 1024;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const MSG_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;

/// What the sniffer learned from the ClientHello
#[derive(Debug, Clone, Default)]
pub struct TlsHelloInfo {
    pub server_name: Option<String>,
    pub alpn_count: usize,
    pub first_alpn: Option<String>,
}

/// Read the ClientHello record and return it parsed plus its raw bytes.
pub async fn read_client_hello<S>(stream: &mut S) -> Result<(TlsHelloInfo, Vec<u8>), RelayError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;

    if header[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(RelayError::MalformedHello(format!(
            "content type {:#04x} is not a handshake record",
            header[0]
        )));
    }
    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if record_len == 0 || record_len > MAX_HELLO_SIZE {
        return Err(RelayError::MalformedHello(format!(
            "implausible record length {record_len}"
        )));
    }

    let mut body = vec![0u8; record_len];
    stream.read_exact(&mut body).await?;

    let info = parse_client_hello(&body)?;
    trace!(
        server_name = info.server_name.as_deref().unwrap_or(""),
        alpn_count = info.alpn_count,
        "sniffed client hello"
    );

    let mut raw = Vec::with_capacity(5 + record_len);
    raw.extend_from_slice(&header);
    raw.extend_from_slice(&body);
    Ok((info, raw))
}

/// Parse the handshake body of a ClientHello record.
fn parse_client_hello(body: &[u8]) -> Result<TlsHelloInfo, RelayError> {
    let malformed = |what: &str| RelayError::MalformedHello(what.to_string());

    // Handshake header: msg type + u24 length.
    if body.len() < 4 || body[0] != MSG_TYPE_CLIENT_HELLO {
        return Err(malformed("not a ClientHello"));
    }
    // version (2) + random (32)
    let mut offset = 4 + 2 + 32;

    // session id
    if offset >= body.len() {
        return Err(malformed("truncated at session id"));
    }
    offset += 1 + body[offset] as usize;

    // cipher suites
    if offset + 2 > body.len() {
        return Err(malformed("truncated at cipher suites"));
    }
    offset += 2 + u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;

    // compression methods
    if offset >= body.len() {
        return Err(malformed("truncated at compression methods"));
    }
    offset += 1 + body[offset] as usize;

    // A ClientHello with no extension block carries no SNI at all.
    if offset + 2 > body.len() {
        return Ok(TlsHelloInfo::default());
    }
    let extensions_len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
    offset += 2;
    let extensions_end = offset + extensions_len;
    if extensions_end > body.len() {
        return Err(malformed("extension block overruns record"));
    }

    let mut info = TlsHelloInfo::default();
    while offset + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let ext_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        offset += 4;
        if offset + ext_len > extensions_end {
            return Err(malformed("extension overruns block"));
        }
        let ext = &body[offset..offset + ext_len];
        match ext_type {
            EXT_SERVER_NAME => info.server_name = Some(parse_server_name(ext)?),
            EXT_ALPN => parse_alpn(ext, &mut info)?,
            _ => {}
        }
        offset += ext_len;
    }
    Ok(info)
}

/// server_name extension: list length, then (type, length, name) entries;
/// only the host_name (0) entry matters.
fn parse_server_name(ext: &[u8]) -> Result<String, RelayError> {
    let malformed = |what: &str| RelayError::MalformedHello(what.to_string());

    if ext.len() < 5 {
        return Err(malformed("server_name extension too short"));
    }
    // skip the list length; a single entry is the only shape seen in practice
    if ext[2] != 0 {
        return Err(malformed("server_name entry is not a host_name"));
    }
    let name_len = u16::from_be_bytes([ext[3], ext[4]]) as usize;
    if 5 + name_len > ext.len() {
        return Err(malformed("host_name overruns extension"));
    }
    String::from_utf8(ext[5..5 + name_len].to_vec())
        .map_err(|_| malformed("host_name is not valid UTF-8"))
}

/// ALPN extension: u16 list length, then length-prefixed protocol names.
fn parse_alpn(ext: &[u8], info: &mut TlsHelloInfo) -> Result<(), RelayError> {
    let malformed = |what: &str| RelayError::MalformedHello(what.to_string());

    if ext.len() < 2 {
        return Err(malformed("alpn extension too short"));
    }
    let list_len = u16::from_be_bytes([ext[0], ext[1]]) as usize;
    if 2 + list_len > ext.len() {
        return Err(malformed("alpn list overruns extension"));
    }
    let mut offset = 2;
    while offset < 2 + list_len {
        let proto_len = ext[offset] as usize;
        offset += 1;
        if offset + proto_len > 2 + list_len {
            return Err(malformed("alpn entry overruns list"));
        }
        if info.alpn_count == 0 {
            info.first_alpn = String::from_utf8(ext[offset..offset + proto_len].to_vec()).ok();
        }
        info.alpn_count += 1;
        offset += proto_len;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    /// Build a minimal but well-formed ClientHello record.
    pub fn client_hello(server_name: Option<&str>, alpn: &[&str]) -> Vec<u8> {
        let mut extensions = Vec::new();

        if let Some(name) = server_name {
            let mut ext = Vec::new();
            ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list len
            ext.push(0x00); // host_name
            ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
            ext.extend_from_slice(name.as_bytes());
            extensions.extend_from_slice(&0x0000u16.to_be_bytes());
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }

        if !alpn.is_empty() {
            let mut list = Vec::new();
            for proto in alpn {
                list.push(proto.len() as u8);
                list.extend_from_slice(proto.as_bytes());
            }
            let mut ext = Vec::new();
            ext.extend_from_slice(&(list.len() as u16).to_be_bytes());
            ext.extend_from_slice(&list);
            extensions.extend_from_slice(&0x0010u16.to_be_bytes());
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }

        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]); // version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0x00); // session id
        hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        hello.extend_from_slice(&[0x01, 0x00]); // null compression
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = vec![0x01]; // ClientHello
        let len = hello.len();
        handshake.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![0x16, 0x03, 0x03]; // handshake, TLS 1.2
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::client_hello;
    use super::*;

    #[tokio::test]
    async fn test_sniff_server_name_and_alpn() {
        let record = client_hello(Some("db.example.test"), &["h2", "http/1.1"]);
        let mut reader = &record[..];

        let (info, raw) = read_client_hello(&mut reader).await.unwrap();
        assert_eq!(info.server_name.as_deref(), Some("db.example.test"));
        assert_eq!(info.alpn_count, 2);
        assert_eq!(info.first_alpn.as_deref(), Some("h2"));
        // The full record must be handed back for replay, byte for byte.
        assert_eq!(raw, record);
        assert!(reader.is_empty(), "sniffer read past the record");
    }

    #[tokio::test]
    async fn test_hello_without_sni() {
        let record = client_hello(None, &[]);
        let mut reader = &record[..];

        let (info, _) = read_client_hello(&mut reader).await.unwrap();
        assert!(info.server_name.is_none());
        assert_eq!(info.alpn_count, 0);
    }

    #[tokio::test]
    async fn test_rejects_non_handshake_record() {
        let mut reader: &[u8] = &[0x17, 0x03, 0x03, 0x00, 0x05, 1, 2, 3, 4, 5];
        assert!(matches!(
            read_client_hello(&mut reader).await,
            Err(RelayError::MalformedHello(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_truncated_record() {
        let record = client_hello(Some("a.example.test"), &[]);
        let mut reader = &record[..record.len() - 4];
        assert!(matches!(
            read_client_hello(&mut reader).await,
            Err(RelayError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_implausible_length() {
        let mut reader: &[u8] = &[0x16, 0x03, 0x03, 0xff, 0xff];
        assert!(matches!(
            read_client_hello(&mut reader).await,
            Err(RelayError::MalformedHello(_))
        ));
    }
}
