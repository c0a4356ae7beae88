//! Remote hosts and the pending-host list.
//!
//! The pending-host list is a plain text file with one `address,name` record per line. It holds exactly
//! the hosts that have not been confirmed done, which makes it the resumable work queue: a restarted run
//! simply picks up whatever is still in the file.

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use colored::*;
use colourado::Color;

use crate::error::RolloutError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Network-reachable identifier, e.g. an IP address.
    pub address: String,
    /// Logical name handed to the remote script.
    pub name: String,
}

impl Host {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }

    /// The `address,name` form used in the pending-host list.
    pub fn to_record(&self) -> String {
        format!("{},{}", self.address, self.name)
    }

    /// For pretty-printing the host name.
    /// Surrounds with brackets and colors it with the given color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        let r = (color.red * 255.0) as u8;
        let g = (color.green * 255.0) as u8;
        let b = (color.blue * 255.0) as u8;
        format!("{}", self).truecolor(r, g, b)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{} ({})]", self.name, self.address)
    }
}

/// A pending-host line that could not be split into its two fields.
#[derive(Debug, PartialEq, Eq)]
pub struct MalformedHost;

impl FromStr for Host {
    type Err = MalformedHost;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Columns past the name are ignored.
        let mut fields = s.split(',');
        let address = fields.next().ok_or(MalformedHost)?.trim();
        let name = fields.next().ok_or(MalformedHost)?.trim();
        if address.is_empty() || name.is_empty() {
            return Err(MalformedHost);
        }
        Ok(Self::new(address, name))
    }
}

/// The file-backed pending-host list.
///
/// Has no synchronization of its own. Within a round only the done-log writer calls
/// [`HostList::remove_host`], so there is never more than one writer.
#[derive(Debug, Clone)]
pub struct HostList {
    path: PathBuf,
}

impl HostList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parses every non-empty line. A malformed line fails the whole load.
    pub fn load_all(&self) -> Result<Vec<Host>, RolloutError> {
        let contents = self.read()?;
        let mut hosts = vec![];
        for (index, line) in contents.lines().enumerate() {
            if let Some(host) = self.parse_line(index, line)? {
                hosts.push(host);
            }
        }
        Ok(hosts)
    }

    /// Drops every record whose address matches `target` and rewrites the file with the rest.
    /// Every other line is written back exactly as it was read. Returns how many records were removed.
    ///
    /// The read and the rewrite are not atomic. A crash in between can leave a truncated file.
    pub fn remove_host(&self, target: &Host) -> Result<usize, RolloutError> {
        let contents = self.read()?;
        let mut removed = 0;
        let mut kept = String::with_capacity(contents.len());
        for (index, line) in contents.lines().enumerate() {
            match self.parse_line(index, line)? {
                Some(host) if host.address == target.address => removed += 1,
                _ => {
                    kept.push_str(line);
                    kept.push('\n');
                }
            }
        }

        let mut file = File::create(&self.path)
            .map_err(|e| RolloutError::storage("truncate hosts file", &self.path, e))?;
        file.write_all(kept.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| RolloutError::storage("rewrite hosts file", &self.path, e))?;

        Ok(removed)
    }

    fn read(&self) -> Result<String, RolloutError> {
        fs::read_to_string(&self.path)
            .map_err(|e| RolloutError::storage("read hosts file", &self.path, e))
    }

    /// `None` for blank lines.
    fn parse_line(&self, index: usize, line: &str) -> Result<Option<Host>, RolloutError> {
        if line.trim().is_empty() {
            return Ok(None);
        }
        line.parse::<Host>()
            .map(Some)
            .map_err(|_| RolloutError::MalformedRecord {
                path: self.path.clone(),
                line: index + 1,
                record: line.to_string(),
            })
    }
}
