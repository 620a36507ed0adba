//! One-shot command client.
//!
//! Used by the `plexus` binary and by tests: open a connection, send one
//! named command, optionally wait for the reply frame.

use {
    crate::{
        commands,
        connection::{normalize_addr, Connection},
        error::{CommError, Result},
        wire::Message,
    },
    log::debug,
    std::time::Duration,
};

/// Commands that answer with an `infos_reply` frame.
pub fn has_reply(command: &str) -> bool {
    matches!(command, "infos" | "dump" | "node_request")
}

/// A short-lived connection to one daemon.
pub struct Client {
    conn: Connection,
    max_frame_size: usize,
}

impl Client {
    /// Connect to `addr` (default port appended when missing).
    pub fn connect(addr: &str, default_port: u16, max_frame_size: usize) -> Result<Self> {
        let addr = normalize_addr(addr, default_port);
        let conn = Connection::dial(&addr, 1, 0)?;
        debug!("client connected to {addr}");
        Ok(Self {
            conn,
            max_frame_size,
        })
    }

    /// Send one command with a single argument part.
    pub fn send(&mut self, command: &str, params: &[u8]) -> Result<()> {
        let id = commands::command_id(command)?;
        Message::command(id, params).write_to(&mut self.conn)
    }

    /// Wait for the reply frame and return its text, bounding the wait.
    pub fn read_reply(&mut self, timeout_ms: u64) -> Result<String> {
        self.conn
            .set_read_timeout(Some(Duration::from_millis(timeout_ms)))?;
        let mut msg = match Message::read_from(&mut self.conn, self.max_frame_size) {
            Ok(msg) => msg,
            Err(CommError::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(CommError::Timeout(timeout_ms));
            }
            Err(e) => return Err(e),
        };
        if !msg.is_sys_command() || commands::command_name(msg.channel) != Some("infos_reply") {
            return Err(CommError::InvalidReply(format!(
                "unexpected frame on channel {}",
                msg.channel
            )));
        }
        Ok(msg.next_str()?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{cluster::ClusterState, config::CommConfig, server},
    };

    #[test]
    fn test_has_reply() {
        assert!(has_reply("infos"));
        assert!(has_reply("dump"));
        assert!(has_reply("node_request"));
        assert!(!has_reply("echo"));
        assert!(!has_reply("exit"));
    }

    #[test]
    fn test_dump_round_trip_against_daemon() {
        let cluster = ClusterState::new(CommConfig::dev_default());
        let _accept = server::start(&cluster, None).unwrap();
        let addr = format!("127.0.0.1:{}", cluster.listen_port());

        let mut client = Client::connect(&addr, 10001, 1 << 20).unwrap();
        client.send("dump", b"").unwrap();
        let reply = client.read_reply(2_000).unwrap();
        // The daemon sees at least our own connection.
        assert!(reply.contains("peer"));
    }

    #[test]
    fn test_unknown_command_rejected_locally() {
        let cluster = ClusterState::new(CommConfig::dev_default());
        let _accept = server::start(&cluster, None).unwrap();
        let addr = format!("127.0.0.1:{}", cluster.listen_port());
        let mut client = Client::connect(&addr, 10001, 1 << 20).unwrap();
        assert!(matches!(
            client.send("frobnicate", b""),
            Err(CommError::UnknownCommand(_))
        ));
    }
}
