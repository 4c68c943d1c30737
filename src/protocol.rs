//! Memcached-style text protocol parser and response generator.
//!
//! The parser is incremental: it is fed whatever slice of the receive buffer
//! is unconsumed, keeps the header bytes it has accepted, and reports how many
//! bytes it took. A header may therefore arrive across any number of reads.
//!
//! Supported commands:
//! - Retrieval: get
//! - Storage: set, add, replace, append, prepend (carry a body)
//! - Deletion: delete
//! - Arithmetic: incr, decr
//! - Other: flush_all, stats, version

use crate::storage::{NonNumericValue, Storage, StorageResult};
use bytes::BytesMut;
use std::str;
use thiserror::Error;

/// Maximum key length allowed by memcached protocol
pub const MAX_KEY_LENGTH: usize = 250;

/// Longest header line accepted, including the trailing `\r\n`
pub const MAX_LINE_LENGTH: usize = 2048;

/// Terminator of header lines and request bodies
pub const DELIMITER: &[u8; 2] = b"\r\n";

/// Parsed command, ready to execute once its body (if any) has arrived
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Get one or more keys
    Get { keys: Vec<String> },

    /// Store a value
    Set(StorageArgs),

    /// Store a value only if key doesn't exist
    Add(StorageArgs),

    /// Store a value only if key exists
    Replace(StorageArgs),

    /// Append data to existing value
    Append(StorageArgs),

    /// Prepend data to existing value
    Prepend(StorageArgs),

    /// Delete a key
    Delete { key: String, noreply: bool },

    /// Increment a numeric value
    Incr { key: String, delta: u64, noreply: bool },

    /// Decrement a numeric value
    Decr { key: String, delta: u64, noreply: bool },

    /// Flush all items
    FlushAll { noreply: bool },

    /// Get server statistics
    Stats,

    /// Get server version
    Version,
}

/// Arguments shared by every body-carrying command
#[derive(Debug, Clone, PartialEq)]
pub struct StorageArgs {
    pub key: String,
    pub flags: u32,
    pub exptime: i64,
    pub bytes: usize,
    pub noreply: bool,
}

/// Header parsing errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Key too long: {0}")]
    KeyTooLong(String),
    #[error("Invalid number: {0}")]
    InvalidNumber(String),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Command line exceeds {} bytes", MAX_LINE_LENGTH)]
    LineTooLong,
    #[error("Command line is not complete")]
    Incomplete,
}

/// Failure while running a parsed command
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecuteError {
    #[error(transparent)]
    NonNumeric(#[from] NonNumericValue),
    #[error("body of {actual} bytes does not match declared {declared}")]
    BodyMismatch { declared: usize, actual: usize },
}

/// Outcome of feeding bytes to the parser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parse {
    /// A full header line has been accepted
    pub complete: bool,
    /// Bytes of the input taken by the parser
    pub consumed: usize,
}

/// Incremental parser for the header line of one request
#[derive(Debug, Default)]
pub struct Parser {
    line: Vec<u8>,
    complete: bool,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget any partially accepted header
    pub fn reset(&mut self) {
        self.line.clear();
        self.complete = false;
    }

    /// Feed `input` to the parser.
    ///
    /// Bytes up to and including the first `\r\n` are taken; anything after
    /// it is left for the caller. When no line end is present the whole input
    /// is taken and retained.
    pub fn parse(&mut self, input: &[u8]) -> Result<Parse, ParseError> {
        if self.complete {
            return Ok(Parse {
                complete: true,
                consumed: 0,
            });
        }

        let mut consumed = 0;
        while consumed < input.len() {
            let rest = &input[consumed..];
            let (chunk, found) = match rest.iter().position(|&b| b == b'\n') {
                Some(pos) => (&rest[..=pos], true),
                None => (rest, false),
            };

            if self.line.len() + chunk.len() > MAX_LINE_LENGTH {
                return Err(ParseError::LineTooLong);
            }
            self.line.extend_from_slice(chunk);
            consumed += chunk.len();

            if found && self.line.ends_with(DELIMITER) {
                self.complete = true;
                break;
            }
        }

        Ok(Parse {
            complete: self.complete,
            consumed,
        })
    }

    /// Turn the accepted header into a command and its declared body size.
    ///
    /// The parser is reset afterwards, ready for the next request.
    pub fn build(&mut self) -> Result<(Command, usize), ParseError> {
        if !self.complete {
            return Err(ParseError::Incomplete);
        }
        let result = Self::parse_line(&self.line[..self.line.len() - DELIMITER.len()]);
        self.reset();
        result
    }

    fn parse_line(line: &[u8]) -> Result<(Command, usize), ParseError> {
        let line = str::from_utf8(line)
            .map_err(|_| ParseError::InvalidCommand("Invalid UTF-8 in command".to_string()))?;

        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(name) = parts.first() else {
            return Err(ParseError::InvalidCommand("Empty command".to_string()));
        };

        let command_name = name.to_lowercase();
        let command = match command_name.as_str() {
            "get" | "gets" => Self::parse_get(&parts)?,
            "set" => Command::Set(Self::parse_storage(&parts)?),
            "add" => Command::Add(Self::parse_storage(&parts)?),
            "replace" => Command::Replace(Self::parse_storage(&parts)?),
            "append" => Command::Append(Self::parse_storage(&parts)?),
            "prepend" => Command::Prepend(Self::parse_storage(&parts)?),
            "delete" => Self::parse_delete(&parts)?,
            "incr" | "decr" => Self::parse_incr_decr(&parts, command_name == "incr")?,
            "flush_all" => Command::FlushAll {
                noreply: Self::noreply(&parts, 1),
            },
            "stats" => Command::Stats,
            "version" => Command::Version,
            _ => return Err(ParseError::UnknownCommand(command_name)),
        };

        let body_size = command.body_size();
        Ok((command, body_size))
    }

    fn key(raw: &str) -> Result<String, ParseError> {
        if raw.len() > MAX_KEY_LENGTH {
            return Err(ParseError::KeyTooLong(raw.to_string()));
        }
        Ok(raw.to_string())
    }

    fn number<T: str::FromStr>(raw: &str, what: &str) -> Result<T, ParseError> {
        raw.parse()
            .map_err(|_| ParseError::InvalidNumber(format!("Invalid {}: {}", what, raw)))
    }

    fn noreply(parts: &[&str], index: usize) -> bool {
        parts
            .get(index)
            .is_some_and(|p| p.eq_ignore_ascii_case("noreply"))
    }

    /// Parse get command
    fn parse_get(parts: &[&str]) -> Result<Command, ParseError> {
        if parts.len() < 2 {
            return Err(ParseError::InvalidCommand(
                "get requires at least one key".to_string(),
            ));
        }

        let keys = parts[1..]
            .iter()
            .map(|key| Self::key(key))
            .collect::<Result<_, _>>()?;
        Ok(Command::Get { keys })
    }

    /// Parse storage commands (set, add, replace, append, prepend)
    fn parse_storage(parts: &[&str]) -> Result<StorageArgs, ParseError> {
        // Format: <command> <key> <flags> <exptime> <bytes> [noreply]
        if parts.len() < 5 {
            return Err(ParseError::InvalidCommand(format!(
                "{} requires key, flags, exptime, and bytes",
                parts[0]
            )));
        }

        Ok(StorageArgs {
            key: Self::key(parts[1])?,
            flags: Self::number(parts[2], "flags")?,
            exptime: Self::number(parts[3], "exptime")?,
            bytes: Self::number(parts[4], "bytes")?,
            noreply: Self::noreply(parts, 5),
        })
    }

    /// Parse delete command
    fn parse_delete(parts: &[&str]) -> Result<Command, ParseError> {
        // Format: delete <key> [noreply]
        if parts.len() < 2 {
            return Err(ParseError::InvalidCommand(
                "delete requires a key".to_string(),
            ));
        }

        Ok(Command::Delete {
            key: Self::key(parts[1])?,
            noreply: Self::noreply(parts, 2),
        })
    }

    /// Parse incr/decr commands
    fn parse_incr_decr(parts: &[&str], is_incr: bool) -> Result<Command, ParseError> {
        // Format: incr|decr <key> <value> [noreply]
        if parts.len() < 3 {
            return Err(ParseError::InvalidCommand(format!(
                "{} requires key and value",
                parts[0]
            )));
        }

        let key = Self::key(parts[1])?;
        let delta = Self::number(parts[2], "value")?;
        let noreply = Self::noreply(parts, 3);

        Ok(if is_incr {
            Command::Incr {
                key,
                delta,
                noreply,
            }
        } else {
            Command::Decr {
                key,
                delta,
                noreply,
            }
        })
    }
}

impl Command {
    /// Bytes of body that follow the header line
    pub fn body_size(&self) -> usize {
        match self {
            Command::Set(args)
            | Command::Add(args)
            | Command::Replace(args)
            | Command::Append(args)
            | Command::Prepend(args) => args.bytes,
            _ => 0,
        }
    }

    /// Run the command against `storage` and render its reply.
    ///
    /// `noreply` variants return an empty buffer.
    pub fn execute(&self, storage: &Storage, body: &[u8]) -> Result<BytesMut, ExecuteError> {
        if body.len() != self.body_size() {
            return Err(ExecuteError::BodyMismatch {
                declared: self.body_size(),
                actual: body.len(),
            });
        }

        let (reply, noreply) = match self {
            Command::Get { keys } => {
                let keys_ref: Vec<&str> = keys.iter().map(|s| s.as_str()).collect();
                let mut response = BytesMut::new();
                for (key, item) in storage.get_multi(&keys_ref) {
                    response.extend_from_slice(&Response::value(&key, item.flags, &item.value));
                }
                response.extend_from_slice(Response::end());
                (response, false)
            }

            Command::Set(args) => (
                Self::stored(storage.set(&args.key, body.to_vec(), args.flags, args.exptime)),
                args.noreply,
            ),
            Command::Add(args) => (
                Self::stored(storage.add(&args.key, body.to_vec(), args.flags, args.exptime)),
                args.noreply,
            ),
            Command::Replace(args) => (
                Self::stored(storage.replace(&args.key, body.to_vec(), args.flags, args.exptime)),
                args.noreply,
            ),
            Command::Append(args) => (
                Self::stored(storage.append(&args.key, body)),
                args.noreply,
            ),
            Command::Prepend(args) => (
                Self::stored(storage.prepend(&args.key, body)),
                args.noreply,
            ),

            Command::Delete { key, noreply } => {
                let reply = match storage.delete(key) {
                    StorageResult::Deleted => Response::deleted(),
                    _ => Response::not_found(),
                };
                (BytesMut::from(reply), *noreply)
            }

            Command::Incr {
                key,
                delta,
                noreply,
            } => (Self::numeric(storage.incr_decr(key, *delta, true)?), *noreply),
            Command::Decr {
                key,
                delta,
                noreply,
            } => (Self::numeric(storage.incr_decr(key, *delta, false)?), *noreply),

            Command::FlushAll { noreply } => {
                storage.flush_all();
                (BytesMut::from(Response::ok()), *noreply)
            }

            Command::Stats => {
                let stats = storage.stats();
                let mut response = BytesMut::new();
                response.extend_from_slice(&Response::stat(
                    "curr_items",
                    &stats.item_count.to_string(),
                ));
                response.extend_from_slice(&Response::stat("bytes", &stats.memory_used.to_string()));
                response.extend_from_slice(&Response::stat(
                    "limit_maxbytes",
                    &stats.max_memory.to_string(),
                ));
                response.extend_from_slice(Response::end());
                (response, false)
            }

            Command::Version => (BytesMut::from(Response::version()), false),
        };

        Ok(if noreply { BytesMut::new() } else { reply })
    }

    fn stored(result: StorageResult) -> BytesMut {
        BytesMut::from(match result {
            StorageResult::Stored => Response::stored(),
            _ => Response::not_stored(),
        })
    }

    fn numeric(result: Option<u64>) -> BytesMut {
        match result {
            Some(value) => Response::numeric(value),
            None => BytesMut::from(Response::not_found()),
        }
    }
}

/// Response generator
pub struct Response;

impl Response {
    /// Generate a VALUE block
    pub fn value(key: &str, flags: u32, data: &[u8]) -> BytesMut {
        let mut response = BytesMut::new();
        response.extend_from_slice(format!("VALUE {} {} {}\r\n", key, flags, data.len()).as_bytes());
        response.extend_from_slice(data);
        response.extend_from_slice(DELIMITER);
        response
    }

    pub fn end() -> &'static [u8] {
        b"END\r\n"
    }

    pub fn stored() -> &'static [u8] {
        b"STORED\r\n"
    }

    pub fn not_stored() -> &'static [u8] {
        b"NOT_STORED\r\n"
    }

    pub fn not_found() -> &'static [u8] {
        b"NOT_FOUND\r\n"
    }

    pub fn deleted() -> &'static [u8] {
        b"DELETED\r\n"
    }

    pub fn ok() -> &'static [u8] {
        b"OK\r\n"
    }

    /// Generate SERVER_ERROR response
    pub fn server_error(msg: &str) -> BytesMut {
        let mut response = BytesMut::new();
        response.extend_from_slice(format!("SERVER_ERROR {}\r\n", msg).as_bytes());
        response
    }

    pub fn version() -> &'static [u8] {
        concat!("VERSION blocking-cache ", env!("CARGO_PKG_VERSION"), "\r\n").as_bytes()
    }

    /// Generate numeric response (for incr/decr)
    pub fn numeric(value: u64) -> BytesMut {
        BytesMut::from(format!("{}\r\n", value).as_bytes())
    }

    /// Generate a STAT line
    pub fn stat(name: &str, value: &str) -> BytesMut {
        BytesMut::from(format!("STAT {} {}\r\n", name, value).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> Result<(Command, usize), ParseError> {
        let mut parser = Parser::new();
        let parse = parser.parse(input)?;
        assert!(parse.complete, "header not complete");
        parser.build()
    }

    #[test]
    fn test_parse_get() {
        let (command, body) = parse_all(b"get foo bar\r\n").unwrap();
        assert_eq!(
            command,
            Command::Get {
                keys: vec!["foo".to_string(), "bar".to_string()]
            }
        );
        assert_eq!(body, 0);
    }

    #[test]
    fn test_parse_set() {
        let (command, body) = parse_all(b"set mykey 5 100 10\r\n").unwrap();
        assert_eq!(
            command,
            Command::Set(StorageArgs {
                key: "mykey".to_string(),
                flags: 5,
                exptime: 100,
                bytes: 10,
                noreply: false,
            })
        );
        assert_eq!(body, 10);
    }

    #[test]
    fn test_parse_set_noreply() {
        let (command, _) = parse_all(b"append k 0 0 3 noreply\r\n").unwrap();
        assert!(matches!(command, Command::Append(StorageArgs { noreply: true, .. })));
    }

    #[test]
    fn test_parse_delete_and_incr() {
        let (command, _) = parse_all(b"delete k noreply\r\n").unwrap();
        assert_eq!(
            command,
            Command::Delete {
                key: "k".to_string(),
                noreply: true
            }
        );

        let (command, _) = parse_all(b"DECR counter 7\r\n").unwrap();
        assert_eq!(
            command,
            Command::Decr {
                key: "counter".to_string(),
                delta: 7,
                noreply: false
            }
        );
    }

    #[test]
    fn test_parse_consumes_only_header() {
        let mut parser = Parser::new();
        let parse = parser.parse(b"set k 0 0 5\r\nhello\r\n").unwrap();
        assert_eq!(
            parse,
            Parse {
                complete: true,
                consumed: 13
            }
        );
        assert_eq!(parser.build().unwrap().1, 5);
    }

    #[test]
    fn test_parse_across_chunks() {
        let mut parser = Parser::new();
        assert_eq!(parser.parse(b"ver").unwrap().consumed, 3);
        assert!(!parser.parse(b"sion\r").unwrap().complete);
        let parse = parser.parse(b"\nget x\r\n").unwrap();
        assert_eq!(
            parse,
            Parse {
                complete: true,
                consumed: 1
            }
        );
        assert_eq!(parser.build().unwrap().0, Command::Version);
    }

    #[test]
    fn test_bare_newline_does_not_terminate() {
        let mut parser = Parser::new();
        assert!(!parser.parse(b"get a\nb").unwrap().complete);
        assert!(parser.parse(b"\r\n").unwrap().complete);
    }

    #[test]
    fn test_build_before_complete() {
        let mut parser = Parser::new();
        parser.parse(b"stats").unwrap();
        assert_eq!(parser.build(), Err(ParseError::Incomplete));
    }

    #[test]
    fn test_line_too_long() {
        let mut parser = Parser::new();
        let long = vec![b'a'; MAX_LINE_LENGTH + 1];
        assert_eq!(parser.parse(&long), Err(ParseError::LineTooLong));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_all(b"bogus\r\n"),
            Err(ParseError::UnknownCommand(_))
        ));
        assert!(matches!(
            parse_all(b"set k x 0 5\r\n"),
            Err(ParseError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_all(b"set k 0 0\r\n"),
            Err(ParseError::InvalidCommand(_))
        ));
        assert!(matches!(parse_all(b"\r\n"), Err(ParseError::InvalidCommand(_))));

        let long_key = format!("get {}\r\n", "k".repeat(MAX_KEY_LENGTH + 1));
        assert!(matches!(
            parse_all(long_key.as_bytes()),
            Err(ParseError::KeyTooLong(_))
        ));
    }

    #[test]
    fn test_execute_set_get() {
        let storage = Storage::new(1024 * 1024);

        let (set, _) = parse_all(b"set k 3 0 5\r\n").unwrap();
        assert_eq!(&set.execute(&storage, b"hello").unwrap()[..], b"STORED\r\n");

        let (get, _) = parse_all(b"get k missing\r\n").unwrap();
        assert_eq!(
            &get.execute(&storage, b"").unwrap()[..],
            b"VALUE k 3 5\r\nhello\r\nEND\r\n"
        );
    }

    #[test]
    fn test_execute_noreply_is_silent() {
        let storage = Storage::new(1024 * 1024);
        let (set, _) = parse_all(b"set k 0 0 1 noreply\r\n").unwrap();
        assert!(set.execute(&storage, b"x").unwrap().is_empty());
        assert!(storage.get("k").is_some());
    }

    #[test]
    fn test_execute_incr_non_numeric_fails() {
        let storage = Storage::new(1024 * 1024);
        storage.set("k", b"abc".to_vec(), 0, 0);

        let (incr, _) = parse_all(b"incr k 1\r\n").unwrap();
        assert_eq!(
            incr.execute(&storage, b""),
            Err(ExecuteError::NonNumeric(NonNumericValue))
        );
    }

    #[test]
    fn test_execute_body_mismatch() {
        let storage = Storage::new(1024 * 1024);
        let (set, _) = parse_all(b"set k 0 0 5\r\n").unwrap();
        assert!(matches!(
            set.execute(&storage, b"abc"),
            Err(ExecuteError::BodyMismatch {
                declared: 5,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_response_server_error() {
        assert_eq!(&Response::server_error("boom")[..], b"SERVER_ERROR boom\r\n");
    }
}
