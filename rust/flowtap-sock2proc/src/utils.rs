use crate::Sock2ProcError;

/// Column holding the owner uid in a `/proc/net/{tcp,udp}[6]` row.
const UID_COLUMN: usize = 7;

/// Convert the hex port suffix of a `local_address` column (`0100007F:1F90`).
pub fn hex_to_port(hex: &str) -> Result<u16, Sock2ProcError> {
    u16::from_str_radix(hex, 16).map_err(|_| Sock2ProcError::MalformedEntry(hex.to_string()))
}

/// Local port of one table row.
pub fn local_port(line: &str) -> Result<u16, Sock2ProcError> {
    let local = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Sock2ProcError::MalformedEntry(line.to_string()))?;
    let (_, port) = local
        .rsplit_once(':')
        .ok_or_else(|| Sock2ProcError::MalformedEntry(local.to_string()))?;
    hex_to_port(port)
}

/// Scan a whole table (header line included) for a socket bound to `port`
/// and return its uid.
///
/// A malformed row aborts the scan: the kernel never emits one, so hitting it
/// means the text is not a `/proc/net` table at all.
pub fn parse_uid(table: &str, port: u16) -> Result<Option<u32>, Sock2ProcError> {
    for line in table.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        if local_port(line)? != port {
            continue;
        }
        let uid = line
            .split_whitespace()
            .nth(UID_COLUMN)
            .ok_or_else(|| Sock2ProcError::MalformedEntry(line.to_string()))?;
        return uid
            .parse::<u32>()
            .map(Some)
            .map_err(|_| Sock2ProcError::MalformedEntry(uid.to_string()));
    }
    Ok(None)
}
