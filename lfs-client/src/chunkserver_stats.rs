//! Chunkserver reliability scores.
//!
//! Every finished read or write attempt reports back here. The resulting
//! score feeds the read planner so that recently failing servers end up in
//! later waves.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lfs_protocol::ChunkserverAddress;

/// How long a registered defect keeps lowering a server's score.
const DEFECT_PENALTY_PERIOD: Duration = Duration::from_secs(30);

const DEFECTIVE_SCORE: f32 = 0.5;

#[derive(Default)]
struct ServerStats {
    defects: u32,
    last_defect: Option<Instant>,
}

/// Process-wide registry of chunkserver statistics.
#[derive(Default)]
pub struct ChunkserverStats {
    servers: Mutex<HashMap<ChunkserverAddress, ServerStats>>,
}

impl ChunkserverStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_success(&self, address: ChunkserverAddress) {
        let mut servers = self.servers.lock().unwrap();
        let entry = servers.entry(address).or_default();
        entry.last_defect = None;
    }

    pub fn register_defect(&self, address: ChunkserverAddress) {
        let mut servers = self.servers.lock().unwrap();
        let entry = servers.entry(address).or_default();
        entry.defects += 1;
        entry.last_defect = Some(Instant::now());
    }

    /// 1.0 for healthy servers, lower for servers with a recent defect.
    pub fn score(&self, address: ChunkserverAddress) -> f32 {
        let servers = self.servers.lock().unwrap();
        match servers.get(&address).and_then(|stats| stats.last_defect) {
            Some(when) if when.elapsed() < DEFECT_PENALTY_PERIOD => DEFECTIVE_SCORE,
            _ => 1.0,
        }
    }

    pub fn defects(&self, address: ChunkserverAddress) -> u32 {
        let servers = self.servers.lock().unwrap();
        servers.get(&address).map(|stats| stats.defects).unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defect_lowers_score_until_success() {
        let stats = ChunkserverStats::new();
        let address = ChunkserverAddress {
            ip: 0x7f000001,
            port: 9422,
        };
        assert_eq!(stats.score(address), 1.0);

        stats.register_defect(address);
        assert_eq!(stats.score(address), DEFECTIVE_SCORE);
        assert_eq!(stats.defects(address), 1);

        stats.register_success(address);
        assert_eq!(stats.score(address), 1.0);
        assert_eq!(stats.defects(address), 1);
    }
}
