//! Remote process discovery through `ps aux`.
//!
//! Rows are located by the character offsets of the header labels rather
//! than by splitting on whitespace, since the command column may contain
//! spaces and the other columns are ragged. The parsing half of this module
//! is pure and works on plain lines, so another process source can feed it.

use tracing::{debug, trace};

use super::error::{CommandError, ProcessListError};
use super::{RemoteHost, tokens};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Listing command run on the remote host.
pub const LIST_COMMAND: &[&str] = &["ps", "aux"];

pub const USER_LABEL: &str = "USER";
pub const PID_LABEL: &str = "PID";
pub const COMMAND_LABEL: &str = "COMMAND";

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Column offsets taken from the header line, counted in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    user_start: usize,
    pid_end: usize,
    command_start: usize,
}

impl Header {
    /// Build column offsets from a line containing all three labels.
    pub fn parse(line: &str) -> Option<Self> {
        Some(Self {
            user_start: char_offset(line, USER_LABEL)?,
            pid_end: char_offset(line, PID_LABEL)? + PID_LABEL.len(),
            command_start: char_offset(line, COMMAND_LABEL)?,
        })
    }
}

/// One parsed row of the listing, not yet tied to a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRow {
    pub user: String,
    pub pid: u32,
    pub command: String,
}

/// Find the first line that carries all three column labels.
pub fn find_header<S: AsRef<str>>(lines: &[S]) -> Option<(usize, Header)> {
    lines
        .iter()
        .enumerate()
        .find_map(|(index, line)| Header::parse(line.as_ref()).map(|header| (index, header)))
}

/// Parse a full listing. Returns `None` when no header line exists; rows
/// that cannot be parsed are dropped.
pub fn parse_listing<S: AsRef<str>>(lines: &[S]) -> Option<Vec<ProcessRow>> {
    let (header_index, header) = find_header(lines)?;

    let rows = lines[header_index + 1..]
        .iter()
        .filter_map(|line| {
            let line = line.as_ref();
            let row = parse_row(line, &header);
            if row.is_none() {
                trace!(line, "skipping unparseable process row");
            }
            row
        })
        .collect();

    Some(rows)
}

/// Parse one data row against the header offsets.
pub fn parse_row(line: &str, header: &Header) -> Option<ProcessRow> {
    Some(ProcessRow {
        user: user_from_line(line, header)?.to_string(),
        pid: pid_from_line(line, header)?,
        command: command_from_line(line, header)?.to_string(),
    })
}

/// First token at or after the start of the USER column.
pub fn user_from_line<'a>(line: &'a str, header: &Header) -> Option<&'a str> {
    tail(line, header.user_start)?.split_whitespace().next()
}

/// Last token before the end of the PID label, as a positive integer.
pub fn pid_from_line(line: &str, header: &Header) -> Option<u32> {
    head(line, header.pid_end)
        .split_whitespace()
        .last()?
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0)
}

/// Everything from the start of the COMMAND column, untouched.
pub fn command_from_line<'a>(line: &'a str, header: &Header) -> Option<&'a str> {
    tail(line, header.command_start).filter(|command| !command.trim().is_empty())
}

/// Character offset of the first occurrence of `label`.
fn char_offset(line: &str, label: &str) -> Option<usize> {
    line.find(label).map(|byte| line[..byte].chars().count())
}

/// Byte index of the `chars`-th character, if the line is that long.
fn byte_index(line: &str, chars: usize) -> Option<usize> {
    line.char_indices()
        .map(|(index, _)| index)
        .chain(std::iter::once(line.len()))
        .nth(chars)
}

fn tail(line: &str, from: usize) -> Option<&str> {
    byte_index(line, from).map(|index| &line[index..])
}

fn head(line: &str, to: usize) -> &str {
    match byte_index(line, to) {
        Some(index) => &line[..index],
        None => line,
    }
}

// ---------------------------------------------------------------------------
// Remote processes
// ---------------------------------------------------------------------------

/// A process seen on a remote host. Holds the connection it was listed on
/// so it can be killed there.
pub struct RemoteProcess<'a, H: ?Sized> {
    host: &'a H,
    pub user: String,
    pub pid: u32,
    pub command: String,
}

impl<H: RemoteHost + ?Sized> RemoteProcess<'_, H> {
    /// Send `kill <pid>` over the connection that listed this process.
    pub async fn kill(&self) -> Result<(), CommandError> {
        debug!(pid = self.pid, host = %self.host.describe(), "killing remote process");
        kill_pid(self.host, self.pid).await
    }
}

impl<H: ?Sized> std::fmt::Debug for RemoteProcess<'_, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcess")
            .field("user", &self.user)
            .field("pid", &self.pid)
            .field("command", &self.command)
            .finish()
    }
}

/// Processes from one listing of a remote host, in listing order.
pub struct RemoteProcessList<'a, H: ?Sized> {
    processes: Vec<RemoteProcess<'a, H>>,
}

impl<H: ?Sized> std::fmt::Debug for RemoteProcessList<'_, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.processes).finish()
    }
}

impl<'a, H: RemoteHost + ?Sized> RemoteProcessList<'a, H> {
    /// Run the listing command on `host` and parse its output.
    pub async fn list(host: &'a H) -> Result<Self, ProcessListError> {
        let command = tokens(LIST_COMMAND.iter().copied());
        let output = host.execute(&command).await?;

        let rows = parse_listing(&output).ok_or_else(|| ProcessListError::HeaderNotFound {
            command: command.join(" "),
        })?;

        debug!(host = %host.describe(), count = rows.len(), "listed remote processes");

        let processes = rows
            .into_iter()
            .map(|row| RemoteProcess {
                host,
                user: row.user,
                pid: row.pid,
                command: row.command,
            })
            .collect();

        Ok(Self { processes })
    }

    /// First process whose command equals `command` and that runs as `user`.
    pub fn find_exact(&self, command: &str, user: &str) -> Option<&RemoteProcess<'a, H>> {
        self.processes
            .iter()
            .find(|p| p.command.trim() == command && p.user == user)
    }

    /// Processes whose command contains `needle`.
    pub fn matching<'s>(
        &'s self,
        needle: &'s str,
    ) -> impl Iterator<Item = &'s RemoteProcess<'a, H>> + 's {
        self.processes
            .iter()
            .filter(move |p| p.command.contains(needle))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RemoteProcess<'a, H>> {
        self.processes.iter()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

impl<'a, H: ?Sized> IntoIterator for RemoteProcessList<'a, H> {
    type Item = RemoteProcess<'a, H>;
    type IntoIter = std::vec::IntoIter<RemoteProcess<'a, H>>;

    fn into_iter(self) -> Self::IntoIter {
        self.processes.into_iter()
    }
}

/// Kill a process by pid on `host`. No read-back.
pub async fn kill_pid<H: RemoteHost + ?Sized>(host: &H, pid: u32) -> Result<(), CommandError> {
    host.execute(&tokens(["kill".to_string(), pid.to_string()]))
        .await
        .map(|_| ())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
