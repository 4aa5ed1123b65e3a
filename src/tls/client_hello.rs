//! TLS ClientHello detection over a partially buffered byte stream.
//!
//! Only the record header and the handshake type are inspected:
//!
//! ```text
//! byte 0      content type     0x16 (handshake)
//! bytes 1-2   record version   SSL 3.0 .. TLS 1.3
//! bytes 3-4   record length    big-endian, at most 2^14
//! byte 5      handshake type   0x01 (ClientHello)
//! ```

/// Content type of a TLS handshake record.
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type of a ClientHello.
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

const SSL_3_0: u16 = 0x0300;
const TLS_1_0: u16 = 0x0301;
const TLS_1_1: u16 = 0x0302;
const TLS_1_2: u16 = 0x0303;
const TLS_1_3: u16 = 0x0304;

/// Record header: type, version, length.
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest plaintext record body a peer may send.
pub const MAX_RECORD_LEN: usize = 1 << 14;

/// Result of probing the buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Too few bytes to decide; read more and call again.
    NotEnoughData,
    /// The stream does not start with a TLS ClientHello.
    NotTlsClientHello,
    /// A complete ClientHello record is buffered.
    ValidTlsClientHello {
        /// Length of the record body, excluding the 5-byte header.
        record_len: usize,
    },
}

impl ParseOutcome {
    pub fn is_tls(&self) -> bool {
        matches!(self, ParseOutcome::ValidTlsClientHello { .. })
    }
}

/// Probe state across partial reads.
///
/// The buffer passed to [`parse`](Self::parse) must always start at byte 0 of
/// the stream and grow monotonically between calls.
#[derive(Debug, Default, Clone)]
pub struct ClientHelloParser {
    record_len: Option<usize>,
}

impl ClientHelloParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify the bytes buffered so far. Never consumes anything.
    pub fn parse(&mut self, buf: &[u8]) -> ParseOutcome {
        let record_len = match self.record_len {
            Some(len) => len,
            None => match Self::parse_header(buf) {
                Ok(len) => {
                    self.record_len = Some(len);
                    len
                }
                Err(outcome) => return outcome,
            },
        };

        if buf.len() < RECORD_HEADER_LEN + record_len {
            return ParseOutcome::NotEnoughData;
        }
        ParseOutcome::ValidTlsClientHello { record_len }
    }

    /// Record length retained from a previous call, if the header was already parsed.
    pub fn record_len(&self) -> Option<usize> {
        self.record_len
    }

    /// Total bytes of the ClientHello record (header included), once known.
    pub fn record_size(&self) -> Option<usize> {
        self.record_len.map(|len| RECORD_HEADER_LEN + len)
    }

    fn parse_header(buf: &[u8]) -> Result<usize, ParseOutcome> {
        let Some(&content_type) = buf.first() else {
            return Err(ParseOutcome::NotEnoughData);
        };
        if content_type != CONTENT_TYPE_HANDSHAKE {
            return Err(ParseOutcome::NotTlsClientHello);
        }

        if buf.len() < 3 {
            return Err(ParseOutcome::NotEnoughData);
        }
        let version = u16::from_be_bytes([buf[1], buf[2]]);
        if !matches!(version, SSL_3_0 | TLS_1_0 | TLS_1_1 | TLS_1_2 | TLS_1_3) {
            return Err(ParseOutcome::NotTlsClientHello);
        }

        if buf.len() < RECORD_HEADER_LEN {
            return Err(ParseOutcome::NotEnoughData);
        }
        let record_len = usize::from(u16::from_be_bytes([buf[3], buf[4]]));
        if record_len == 0 || record_len > MAX_RECORD_LEN {
            return Err(ParseOutcome::NotTlsClientHello);
        }

        match buf.get(RECORD_HEADER_LEN) {
            None => Err(ParseOutcome::NotEnoughData),
            Some(&HANDSHAKE_TYPE_CLIENT_HELLO) => Ok(record_len),
            Some(_) => Err(ParseOutcome::NotTlsClientHello),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A syntactically plausible ClientHello record with `body_len` body bytes.
    pub(crate) fn client_hello_record(version: u16, body_len: usize) -> Vec<u8> {
        let mut record = vec![CONTENT_TYPE_HANDSHAKE];
        record.extend_from_slice(&version.to_be_bytes());
        record.extend_from_slice(&(body_len as u16).to_be_bytes());
        record.push(HANDSHAKE_TYPE_CLIENT_HELLO);
        record.extend((1..body_len).map(|i| i as u8));
        record
    }

    #[test]
    fn empty_buffer_needs_more() {
        assert_eq!(ClientHelloParser::new().parse(&[]), ParseOutcome::NotEnoughData);
    }

    #[test]
    fn plaintext_is_rejected_on_first_byte() {
        let mut parser = ClientHelloParser::new();
        assert_eq!(parser.parse(b"G"), ParseOutcome::NotTlsClientHello);
        assert_eq!(parser.parse(b"GET / HTTP/1.1\r\n"), ParseOutcome::NotTlsClientHello);
    }

    #[test]
    fn every_known_version_is_accepted() {
        for version in [SSL_3_0, TLS_1_0, TLS_1_1, TLS_1_2, TLS_1_3] {
            let record = client_hello_record(version, 64);
            assert_eq!(
                ClientHelloParser::new().parse(&record),
                ParseOutcome::ValidTlsClientHello { record_len: 64 },
                "version {version:#06x}"
            );
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        let record = client_hello_record(0x0500, 64);
        assert_eq!(ClientHelloParser::new().parse(&record[..3]), ParseOutcome::NotTlsClientHello);
        assert_eq!(ClientHelloParser::new().parse(&record), ParseOutcome::NotTlsClientHello);
    }

    #[test]
    fn non_client_hello_handshake_is_rejected() {
        let mut record = client_hello_record(TLS_1_2, 16);
        record[5] = 0x02;
        assert_eq!(ClientHelloParser::new().parse(&record), ParseOutcome::NotTlsClientHello);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let record = [CONTENT_TYPE_HANDSHAKE, 0x03, 0x01, 0x40, 0x01, HANDSHAKE_TYPE_CLIENT_HELLO];
        assert_eq!(ClientHelloParser::new().parse(&record), ParseOutcome::NotTlsClientHello);
    }

    #[test]
    fn every_prefix_of_a_hello_needs_more() {
        let record = client_hello_record(TLS_1_0, 200);
        for end in 0..record.len() {
            let mut parser = ClientHelloParser::new();
            assert_eq!(parser.parse(&record[..end]), ParseOutcome::NotEnoughData, "prefix {end}");
        }
    }

    #[test]
    fn record_length_is_retained_across_calls() {
        let record = client_hello_record(TLS_1_2, 100);
        let mut parser = ClientHelloParser::new();

        assert_eq!(parser.parse(&record[..10]), ParseOutcome::NotEnoughData);
        assert_eq!(parser.record_len(), Some(100));
        assert_eq!(parser.record_size(), Some(105));

        assert_eq!(parser.parse(&record[..50]), ParseOutcome::NotEnoughData);
        assert_eq!(
            parser.parse(&record),
            ParseOutcome::ValidTlsClientHello { record_len: 100 }
        );
    }

    #[test]
    fn trailing_bytes_after_the_record_are_fine() {
        let mut bytes = client_hello_record(TLS_1_2, 32);
        bytes.extend_from_slice(&[0x17; 40]);
        assert!(ClientHelloParser::new().parse(&bytes).is_tls());
    }
}
