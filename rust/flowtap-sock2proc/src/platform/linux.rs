use std::fs;

use tracing::{debug, trace};

use crate::utils::parse_uid;
use crate::{Sock2ProcError, Transport};

/// Scan the IPv6 table first, then the IPv4 table.
pub fn find_uid(transport: Transport, local_port: u16) -> Result<u32, Sock2ProcError> {
    for table in transport.tables() {
        let content = match fs::read_to_string(table) {
            Ok(content) => content,
            Err(e) => {
                debug!("Cannot read {}: {}", table, e);
                continue;
            }
        };

        if let Some(uid) = parse_uid(&content, local_port)? {
            trace!("{} port {} owned by uid {} ({})", transport, local_port, uid, table);
            return Ok(uid);
        }
    }

    Err(Sock2ProcError::SocketNotFound(local_port))
}
