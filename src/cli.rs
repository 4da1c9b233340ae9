//! # Command-line interface
//!
//! Argument parsing for the `vde3d` binary: where to look for additional
//! modules, where the datagram transport's rendezvous directory lives, and
//! how verbose to be. Configuration persistence is out of scope;
//! this is the whole of it.

use std::path::PathBuf;

use clap::Parser;

/// `vde3d` — a user-space virtual Ethernet hub over a vde2-compatible
/// datagram transport.
#[derive(Parser, Debug, Clone)]
#[command(name = "vde3d", version, about, long_about = None)]
pub struct Args {
    /// Base directory for the two vde2-compatible datagram transports this
    /// daemon starts: `<dir>/hub` (the data plane) and `<dir>/ctrl` (the
    /// control plane), each getting its own rendezvous socket and
    /// per-connection datagram sockets.
    #[arg(short = 'd', long, default_value = "/tmp/vde3.ctl")]
    pub socket_dir: PathBuf,

    /// Additional directories to scan (non-recursively) for `*.so` modules,
    /// beyond the built-in `hub`/`ctrl`/datagram-transport modules (spec
    /// §4.6). May be given more than once.
    #[arg(short = 'M', long = "module-path")]
    pub module_paths: Vec<PathBuf>,

    /// Increase log verbosity: unset is INFO, `-v` is DEBUG, `-vv` or more
    /// is TRACE.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress the colorized stdout log; detailed logs still go to
    /// `--log-file`.
    #[arg(short, long)]
    pub quiet: bool,

    /// Where to write the detailed log. `stderr` logs there instead of a
    /// rolling file.
    #[arg(long)]
    pub log_file: Option<String>,
}
