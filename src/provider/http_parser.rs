//! Incremental HTTP/1.1 response parser
//!
//! Bytes are fed as they arrive. The parser tracks the status line, the
//! headers and the body (chunked, content-length or read-until-close) and
//! accumulates decoded body bytes for the caller to consume.

use std::mem;

use crate::utils::ProtocolError;

/// Parsed response so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    /// Decoded body bytes not yet consumed by the caller
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// First header with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Most headers accepted in a response head or trailer
const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Head,
    Length(usize),
    Chunked(Chunk),
    UntilClose,
    Done,
    Error,
}

/// What changed during one [`HttpParser::feed`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseProgress {
    /// The header block completed during this call
    pub headers_done: bool,
    /// The response is complete
    pub done: bool,
}

/// Response framing on top of `httparse`; keeps unparsed input between feeds
#[derive(Debug)]
pub struct HttpParser {
    phase: Phase,
    input: Vec<u8>,
    response: HttpResponse,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpParser {
    pub fn new() -> Self {
        Self {
            phase: Phase::Head,
            input: Vec::new(),
            response: HttpResponse::default(),
        }
    }

    /// Forget everything, ready for the next response
    pub fn reset(&mut self) {
        self.phase = Phase::Head;
        self.input.clear();
        self.response = HttpResponse::default();
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    pub fn body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.response.body
    }

    pub fn headers_complete(&self) -> bool {
        self.phase != Phase::Head
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Feed received bytes
    pub fn feed(&mut self, data: &[u8]) -> Result<ParseProgress, ProtocolError> {
        if self.phase == Phase::Error {
            return Err(ProtocolError::Http("parser is in error state".to_string()));
        }
        let mut input = mem::take(&mut self.input);
        input.extend_from_slice(data);

        let mut progress = ParseProgress::default();
        let mut pos = 0;
        let result = self.run(&input, &mut pos, &mut progress);

        input.drain(..pos);
        self.input = input;
        match result {
            Ok(()) => {
                progress.done = self.phase == Phase::Done;
                Ok(progress)
            }
            Err(e) => {
                self.phase = Phase::Error;
                Err(e)
            }
        }
    }

    fn run(
        &mut self,
        input: &[u8],
        pos: &mut usize,
        progress: &mut ParseProgress,
    ) -> Result<(), ProtocolError> {
        loop {
            let rest = &input[*pos..];
            match self.phase {
                Phase::Head => {
                    let Some(used) = self.parse_head(rest)? else {
                        return Ok(());
                    };
                    *pos += used;
                    progress.headers_done = true;
                    self.phase = self.body_phase()?;
                }
                Phase::Length(remaining) => {
                    let take = remaining.min(rest.len());
                    self.response.body.extend_from_slice(&rest[..take]);
                    *pos += take;
                    if take == remaining {
                        self.phase = Phase::Done;
                    } else {
                        self.phase = Phase::Length(remaining - take);
                        return Ok(());
                    }
                }
                Phase::UntilClose => {
                    self.response.body.extend_from_slice(rest);
                    *pos += rest.len();
                    return Ok(());
                }
                Phase::Chunked(Chunk::Size) => {
                    let (used, size) = match httparse::parse_chunk_size(rest) {
                        Ok(httparse::Status::Complete(parsed)) => parsed,
                        Ok(httparse::Status::Partial) => return Ok(()),
                        Err(_) => return Err(ProtocolError::Http("bad chunk size".to_string())),
                    };
                    *pos += used;
                    let size = usize::try_from(size)
                        .map_err(|_| ProtocolError::Http(format!("chunk of {} bytes", size)))?;
                    self.phase = if size == 0 {
                        Phase::Chunked(Chunk::Trailer)
                    } else {
                        Phase::Chunked(Chunk::Data(size))
                    };
                }
                Phase::Chunked(Chunk::Data(remaining)) => {
                    if rest.is_empty() {
                        return Ok(());
                    }
                    let take = remaining.min(rest.len());
                    self.response.body.extend_from_slice(&rest[..take]);
                    *pos += take;
                    self.phase = if take == remaining {
                        Phase::Chunked(Chunk::DataEnd)
                    } else {
                        Phase::Chunked(Chunk::Data(remaining - take))
                    };
                }
                Phase::Chunked(Chunk::DataEnd) => {
                    if rest.len() < 2 {
                        if !b"\r\n".starts_with(rest) {
                            return Err(ProtocolError::Http("missing CRLF after chunk".to_string()));
                        }
                        return Ok(());
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(ProtocolError::Http("missing CRLF after chunk".to_string()));
                    }
                    *pos += 2;
                    self.phase = Phase::Chunked(Chunk::Size);
                }
                Phase::Chunked(Chunk::Trailer) => {
                    let mut trailers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                    match httparse::parse_headers(rest, &mut trailers) {
                        Ok(httparse::Status::Complete((used, _))) => {
                            *pos += used;
                            self.phase = Phase::Done;
                        }
                        Ok(httparse::Status::Partial) => return Ok(()),
                        Err(e) => return Err(ProtocolError::Http(format!("bad trailer: {}", e))),
                    }
                }
                Phase::Done | Phase::Error => return Ok(()),
            }
        }
    }

    /// Parse the status line and headers. Returns the bytes they took once
    /// the head is complete.
    fn parse_head(&mut self, buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut head = httparse::Response::new(&mut headers);
        let used = match head.parse(buf) {
            Ok(httparse::Status::Complete(used)) => used,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ProtocolError::Http(format!("bad response head: {}", e))),
        };

        self.response.status = head.code.unwrap_or_default();
        self.response.reason = head.reason.unwrap_or_default().to_string();
        self.response.headers = head
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect();
        Ok(Some(used))
    }

    fn body_phase(&self) -> Result<Phase, ProtocolError> {
        let status = self.response.status;
        if (100..200).contains(&status) || status == 204 || status == 304 {
            return Ok(Phase::Done);
        }
        if let Some(te) = self.response.header("Transfer-Encoding") {
            if te.to_ascii_lowercase().contains("chunked") {
                return Ok(Phase::Chunked(Chunk::Size));
            }
        }
        match self.response.header("Content-Length") {
            Some(len) => {
                let len: usize = len
                    .parse()
                    .map_err(|_| ProtocolError::Http(format!("bad Content-Length: {}", len)))?;
                Ok(if len == 0 { Phase::Done } else { Phase::Length(len) })
            }
            None => Ok(Phase::UntilClose),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNKED: &[u8] = b"HTTP/1.1 200 OK\r\n\
        Transfer-Encoding: chunked\r\n\
        Content-Type: application/json\r\n\
        \r\n\
        5\r\nhello\r\n\
        7\r\n, world\r\n\
        0\r\n\r\n";

    #[test]
    fn test_chunked_in_one_piece() {
        let mut parser = HttpParser::new();
        let progress = parser.feed(CHUNKED).unwrap();
        assert!(progress.headers_done);
        assert!(progress.done);
        assert_eq!(parser.response().status, 200);
        assert_eq!(parser.response().reason, "OK");
        assert_eq!(parser.response().header("content-type"), Some("application/json"));
        assert_eq!(parser.response().body, b"hello, world");
    }

    #[test]
    fn test_chunked_byte_by_byte() {
        let mut parser = HttpParser::new();
        let mut headers_seen = 0;
        for byte in CHUNKED {
            let progress = parser.feed(std::slice::from_ref(byte)).unwrap();
            if progress.headers_done {
                headers_seen += 1;
            }
        }
        assert_eq!(headers_seen, 1);
        assert!(parser.is_done());
        assert_eq!(parser.response().body, b"hello, world");
    }

    #[test]
    fn test_content_length_body() {
        let mut parser = HttpParser::new();
        let progress = parser
            .feed(b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot ")
            .unwrap();
        assert!(progress.headers_done);
        assert!(!progress.done);
        assert!(parser.headers_complete());

        let progress = parser.feed(b"found").unwrap();
        assert!(!progress.headers_done);
        assert!(progress.done);
        assert_eq!(parser.response().status, 404);
        assert_eq!(parser.response().body, b"Not found");
    }

    #[test]
    fn test_until_close_body_keeps_accumulating() {
        let mut parser = HttpParser::new();
        parser.feed(b"HTTP/1.0 200 OK\r\n\r\nabc").unwrap();
        parser.body_mut().clear();
        parser.feed(b"def").unwrap();
        assert_eq!(parser.response().body, b"def");
        assert!(!parser.is_done());
    }

    #[test]
    fn test_malformed_input() {
        let mut parser = HttpParser::new();
        assert!(parser.feed(b"SMTP ready\r\n").is_err());
        // Stays failed until reset
        assert!(parser.feed(b"HTTP/1.1 200 OK\r\n").is_err());

        parser.reset();
        assert!(parser.feed(b"HTTP/1.1 200 OK\r\n").is_ok());
        assert!(parser
            .feed(b"Transfer-Encoding: chunked\r\n\r\nzz\r\n")
            .is_err());

        parser.reset();
        assert!(parser
            .feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabcX")
            .is_err());
    }

    #[test]
    fn test_chunk_extension_and_trailer() {
        let mut parser = HttpParser::new();
        let progress = parser
            .feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    4;name=value\r\nrev1\r\n0\r\nX-Checksum: 1\r\n\r\n")
            .unwrap();
        assert!(progress.done);
        assert_eq!(parser.response().body, b"rev1");
    }

    #[test]
    fn test_reset_between_responses() {
        let mut parser = HttpParser::new();
        parser
            .feed(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        assert!(parser.is_done());

        parser.reset();
        assert!(!parser.headers_complete());
        let progress = parser
            .feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap();
        assert!(progress.headers_done);
        assert_eq!(parser.response().status, 200);
        assert!(parser.response().body.is_empty());
    }
}
