use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::ScanError;

/// Name reported for ports outside the well-known table.
pub const UNKNOWN_SERVICE: &str = "unknown";

const WELL_KNOWN: &[(u16, &str)] = &[
    (21, "FTP"),
    (22, "SSH"),
    (23, "Telnet"),
    (25, "SMTP"),
    (53, "DNS"),
    (80, "HTTP"),
    (110, "POP3"),
    (115, "SFTP"),
    (135, "MS-RPC"),
    (139, "NetBIOS"),
    (143, "IMAP"),
    (194, "IRC"),
    (443, "HTTPS"),
    (445, "SMB"),
    (1433, "MS-SQL"),
    (3306, "MySQL"),
    (3389, "RDP"),
    (5432, "PostgreSQL"),
    (5900, "VNC"),
    (8080, "HTTP-alt"),
];

/// Well-known service name for `port`, or `"unknown"`.
pub fn service_name(port: u16) -> &'static str {
    WELL_KNOWN
        .iter()
        .find(|(p, _)| *p == port)
        .map(|(_, name)| *name)
        .unwrap_or(UNKNOWN_SERVICE)
}

/// The fixed, ordered port list used by quick scans.
pub fn common_ports() -> Vec<u16> {
    WELL_KNOWN.iter().map(|(p, _)| *p).collect()
}

/// Inclusive TCP port range. Valid when `1 <= start <= end`.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, ScanError> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    pub fn single(port: u16) -> Result<Self, ScanError> {
        Self::new(port, port)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.start == 0 || self.start > self.end {
            return Err(ScanError::InvalidPortRange {
                start: u32::from(self.start),
                end: u32::from(self.end),
            });
        }
        Ok(())
    }

    /// Number of ports covered (`end - start + 1`).
    pub fn len(&self) -> u64 {
        u64::from(self.end) - u64::from(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_port_range(s)
    }
}

/// Parse `"start-end"` or a single `"port"` into a validated range.
pub fn parse_port_range(s: &str) -> Result<PortRange> {
    let s = s.trim();
    let (a, b) = s.split_once('-').unwrap_or((s, s));
    let start = parse_port_value(a.trim())
        .with_context(|| format!("invalid start in range: {a}"))?;
    let end = parse_port_value(b.trim())
        .with_context(|| format!("invalid end in range: {b}"))?;
    if start > end {
        return Err(ScanError::InvalidPortRange { start, end }.into());
    }
    Ok(PortRange {
        start: start as u16,
        end: end as u16,
    })
}

/// Parse a port list into a deduplicated list of TCP ports (1..=65535).
///
/// Entries are separated by commas or newlines. Each entry is a single
/// port (`80`) or an inclusive range (`8000-8010`). Everything after `#`
/// on a line is ignored, as are whitespace and blank entries.
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        for entry in line.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let range = parse_port_range(entry)
                .with_context(|| format!("line {line_no}: invalid port entry: {entry}"))?;
            for p in range.iter() {
                if seen.insert(p) {
                    out.push(p);
                }
            }
        }
    }

    if out.is_empty() {
        bail!("port list is empty");
    }
    Ok(out)
}

fn parse_port_value(s: &str) -> Result<u32> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val)
}
