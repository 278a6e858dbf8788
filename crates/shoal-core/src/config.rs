//! Command-line options for the peer daemon.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const USAGE: &str = "\
Usage: shoald -i <id> -c <inventory-file> -m <max-conn> [options]

  -i, --identity <id>       This peer's id in the roster (nonzero)
  -p, --peer-file <path>    Peer roster file (default: nodes.map)
  -c, --chunk-file <path>   Serialized inventory of held chunks
  -m, --max-conn <n>        Max concurrent uploads before DENIED
  -v, --verbose <0..3>      0 silent, 1 warning, 2 info, 3 debug (default: 0)
  -t, --timeout <secs>      Fixed retransmission timeout; 0 = RTT estimator";

/// Parsed command-line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerOptions {
    pub identity: u32,
    pub peer_file: PathBuf,
    pub chunk_file: PathBuf,
    pub max_conn: usize,
    pub verbose: u8,
    pub timeout_secs: u64,
}

impl PeerOptions {
    /// Parse the argument list (without the program name).
    pub fn parse<I>(args: I) -> Result<Self, OptionsError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut identity = None;
        let mut peer_file = None;
        let mut chunk_file = None;
        let mut max_conn = None;
        let mut verbose = 0u8;
        let mut timeout_secs = 0u64;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-i" | "--identity" => identity = Some(number(&arg, args.next())?),
                "-p" | "--peer-file" => peer_file = Some(PathBuf::from(value(&arg, args.next())?)),
                "-c" | "--chunk-file" => {
                    chunk_file = Some(PathBuf::from(value(&arg, args.next())?))
                }
                "-m" | "--max-conn" => max_conn = Some(number(&arg, args.next())?),
                "-v" | "--verbose" => verbose = number(&arg, args.next())?,
                "-t" | "--timeout" => timeout_secs = number(&arg, args.next())?,
                other => return Err(OptionsError::Unknown(other.to_string())),
            }
        }

        Ok(Self {
            identity: identity.ok_or(OptionsError::Required("-i"))?,
            peer_file: peer_file.unwrap_or_else(|| PathBuf::from("nodes.map")),
            chunk_file: chunk_file.ok_or(OptionsError::Required("-c"))?,
            max_conn: max_conn.ok_or(OptionsError::Required("-m"))?,
            verbose,
            timeout_secs,
        })
    }

    /// The fixed retransmission timeout, or `None` to estimate from RTT.
    pub fn fixed_rto(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

fn value(flag: &str, arg: Option<String>) -> Result<String, OptionsError> {
    arg.ok_or_else(|| OptionsError::MissingValue(flag.to_string()))
}

fn number<T: FromStr>(flag: &str, arg: Option<String>) -> Result<T, OptionsError> {
    let raw = value(flag, arg)?;
    raw.parse().map_err(|_| OptionsError::Invalid {
        flag: flag.to_string(),
        value: raw,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    #[error("missing required option {0}")]
    Required(&'static str),

    #[error("option {0} requires a value")]
    MissingValue(String),

    #[error("invalid value for {flag}: {value:?}")]
    Invalid { flag: String, value: String },

    #[error("unknown argument {0:?}")]
    Unknown(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
