use crate::{Error, Result};
use models::{
    ConsensusPhase, ConsensusRecord, FragmentSpec, ManifestChunk, NodeStatus, Placement,
    RedundancyMode, StorageNode, VideoManifest, VideoStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// A video's stored metadata.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VideoRow {
    pub video_id: String,
    pub title: String,
    pub duration_sec: i64,
    pub total_chunks: i64,
    pub chunk_duration_sec: i64,
    pub chunk_size_bytes: i64,
    pub created_at: String,
    pub status: VideoStatus,
}

/// Everything phase 3 of a consensus round writes, atomically.
#[derive(Debug, Clone)]
pub struct PlacementCommit {
    pub chunk_id: String,
    pub video_id: String,
    pub sequence_num: u32,
    pub size_bytes: u64,
    pub checksum: String,
    pub ballot: u64,
    pub placement: Placement,
}

/// Row counts for the service stats endpoint.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ServiceStats {
    pub total_videos: i64,
    pub total_chunks: i64,
    pub total_replicas: i64,
    pub total_fragments: i64,
}

/// Physical-vs-logical storage accounting across redundancy modes.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StorageOverhead {
    pub replication_chunks: i64,
    pub erasure_coded_chunks: i64,
    pub total_logical_bytes: i64,
    pub total_physical_bytes: i64,
    pub storage_savings_percent: f64,
}

pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the store at `path` and bootstrap its
    /// schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// An in-memory store, for tests and ephemeral deployments.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    // Videos.

    pub fn create_video(
        &self,
        video_id: &str,
        title: &str,
        duration_sec: i64,
        chunk_duration_sec: i64,
        chunk_size_bytes: i64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO videos
                 (video_id, title, duration_sec, total_chunks,
                  chunk_duration_sec, chunk_size_bytes, status)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, 'uploading')",
            params![video_id, title, duration_sec, chunk_duration_sec, chunk_size_bytes],
        )?;
        Ok(())
    }

    pub fn video(&self, video_id: &str) -> Result<Option<VideoRow>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "SELECT video_id, title, duration_sec, total_chunks,
                        chunk_duration_sec, chunk_size_bytes, created_at, status
                 FROM videos WHERE video_id = ?1",
                params![video_id],
                video_row,
            )
            .optional()?;
        row.transpose()
    }

    pub fn list_videos(&self, limit: i64, offset: i64) -> Result<Vec<VideoRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT video_id, title, duration_sec, total_chunks,
                    chunk_duration_sec, chunk_size_bytes, created_at, status
             FROM videos
             WHERE status != 'deleted'
             ORDER BY created_at DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], video_row)?;
        let mut videos = Vec::new();
        for row in rows {
            videos.push(row??);
        }
        Ok(videos)
    }

    pub fn update_video_status(&self, video_id: &str, status: VideoStatus) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE videos SET status = ?2 WHERE video_id = ?1",
            params![video_id, status.as_str()],
        )?;
        if changed == 0 {
            return Err(Error::VideoNotFound(video_id.to_string()));
        }
        Ok(())
    }

    /// Assemble the manifest for `video_id`: video metadata plus its
    /// committed chunks in sequence order, each with its placement.
    pub fn video_manifest(&self, video_id: &str) -> Result<Option<VideoManifest>> {
        let Some(video) = self.video(video_id)? else {
            return Ok(None);
        };

        let db = self.db.lock().unwrap();
        let mut chunks_stmt = db.prepare(
            "SELECT chunk_id, sequence_num, size_bytes, checksum, redundancy_mode
             FROM chunks WHERE video_id = ?1 ORDER BY sequence_num",
        )?;
        let chunk_rows: Vec<(String, u32, i64, String, String)> = chunks_stmt
            .query_map(params![video_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut chunks = Vec::with_capacity(chunk_rows.len());
        for (chunk_id, sequence_num, size_bytes, checksum, mode) in chunk_rows {
            let redundancy_mode = RedundancyMode::parse(&mode)
                .ok_or_else(|| Error::CorruptRow(format!("redundancy mode '{mode}'")))?;

            let mut replicas_stmt = db.prepare(
                "SELECT node_url FROM chunk_replicas
                 WHERE chunk_id = ?1 AND status = 'active'
                 ORDER BY node_url",
            )?;
            let replicas: Vec<String> = replicas_stmt
                .query_map(params![chunk_id], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;

            let fragments = match redundancy_mode {
                RedundancyMode::Replication => None,
                RedundancyMode::ErasureCoding => {
                    Some(fragments_of(&db, &chunk_id)?)
                }
            };

            chunks.push(ManifestChunk {
                chunk_id,
                sequence_num,
                size_bytes: size_bytes as u64,
                checksum,
                redundancy_mode,
                replicas,
                fragments,
            });
        }

        Ok(Some(VideoManifest {
            video_id: video.video_id,
            title: video.title,
            duration_sec: video.duration_sec,
            total_chunks: video.total_chunks,
            chunk_duration_sec: video.chunk_duration_sec,
            chunk_size_bytes: video.chunk_size_bytes,
            status: video.status,
            chunks,
        }))
    }

    pub fn chunk_fragments(&self, chunk_id: &str) -> Result<Vec<FragmentSpec>> {
        let db = self.db.lock().unwrap();
        fragments_of(&db, chunk_id)
    }

    // Storage nodes.

    pub fn register_node(&self, node_url: &str, node_id: &str, version: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO storage_nodes
                 (node_url, node_id, last_heartbeat, status, version)
             VALUES (?1, ?2, CURRENT_TIMESTAMP, 'healthy', ?3)",
            params![node_url, node_id, version],
        )?;
        Ok(())
    }

    pub fn record_heartbeat(
        &self,
        node_id: &str,
        disk_usage_percent: f64,
        chunk_count: i64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE storage_nodes
             SET last_heartbeat = CURRENT_TIMESTAMP,
                 disk_usage_percent = ?2,
                 chunk_count = ?3,
                 status = 'healthy'
             WHERE node_id = ?1",
            params![node_id, disk_usage_percent, chunk_count],
        )?;
        if changed == 0 {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }
        Ok(())
    }

    /// Nodes marked healthy whose heartbeat is within `ttl`, least-loaded
    /// (by disk usage) first.
    pub fn healthy_nodes(&self, ttl: Duration) -> Result<Vec<StorageNode>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT node_url, node_id, last_heartbeat, disk_usage_percent,
                    chunk_count, status, version
             FROM storage_nodes
             WHERE status = 'healthy'
               AND datetime(last_heartbeat) > datetime('now', ?1)
             ORDER BY disk_usage_percent ASC",
        )?;
        let rows = stmt.query_map(params![ttl_modifier(ttl)], node_row)?;
        collect_nodes(rows)
    }

    pub fn all_nodes(&self) -> Result<Vec<StorageNode>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT node_url, node_id, last_heartbeat, disk_usage_percent,
                    chunk_count, status, version
             FROM storage_nodes ORDER BY node_id",
        )?;
        let rows = stmt.query_map([], node_row)?;
        collect_nodes(rows)
    }

    /// Force nodes without a heartbeat in `ttl` to `down`, returning the
    /// urls of the nodes transitioned.
    pub fn mark_stale_nodes_down(&self, ttl: Duration) -> Result<Vec<String>> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let stale: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT node_url FROM storage_nodes
                 WHERE datetime(last_heartbeat) < datetime('now', ?1)
                   AND status != 'down'",
            )?;
            let rows = stmt.query_map(params![ttl_modifier(ttl)], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for node_url in &stale {
            tx.execute(
                "UPDATE storage_nodes SET status = 'down' WHERE node_url = ?1",
                params![node_url],
            )?;
        }
        tx.commit()?;
        Ok(stale)
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Result<Vec<StorageNode>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT node_url, node_id, last_heartbeat, disk_usage_percent,
                    chunk_count, status, version
             FROM storage_nodes WHERE status = ?1 ORDER BY node_id",
        )?;
        let rows = stmt.query_map(params![status.as_str()], node_row)?;
        collect_nodes(rows)
    }

    pub fn set_node_status(&self, node_url: &str, status: NodeStatus) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE storage_nodes SET status = ?2 WHERE node_url = ?1",
            params![node_url, status.as_str()],
        )?;
        if changed == 0 {
            return Err(Error::NodeNotFound(node_url.to_string()));
        }
        Ok(())
    }

    /// Count of nodes per status label.
    pub fn node_health_summary(&self) -> Result<std::collections::BTreeMap<String, i64>> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare("SELECT status, COUNT(*) FROM storage_nodes GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get(1)?)))?;
        rows.map(|row| row.map_err(Error::from)).collect()
    }

    /// Refresh a node's heartbeat and mark it healthy, on behalf of the
    /// health monitor when a direct probe finds a down node responsive.
    pub fn touch_node(&self, node_url: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE storage_nodes
             SET last_heartbeat = CURRENT_TIMESTAMP, status = 'healthy'
             WHERE node_url = ?1",
            params![node_url],
        )?;
        if changed == 0 {
            return Err(Error::NodeNotFound(node_url.to_string()));
        }
        Ok(())
    }

    /// Rewind a node's heartbeat by `seconds`. Exists for TTL tests and
    /// operational rehearsal; production writes go through
    /// [`Store::record_heartbeat`].
    pub fn backdate_heartbeat(&self, node_id: &str, seconds: u64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE storage_nodes
             SET last_heartbeat = datetime('now', ?2)
             WHERE node_id = ?1",
            params![node_id, format!("-{seconds} seconds")],
        )?;
        if changed == 0 {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }
        Ok(())
    }

    // Consensus records.

    pub fn consensus_record(&self, chunk_id: &str) -> Result<Option<ConsensusRecord>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "SELECT chunk_id, promised_ballot, accepted_ballot, accepted_value, phase
                 FROM consensus_state WHERE chunk_id = ?1",
                params![chunk_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((chunk_id, promised, accepted, value, phase)) = row else {
            return Ok(None);
        };
        let phase = ConsensusPhase::parse(&phase)
            .ok_or_else(|| Error::CorruptRow(format!("consensus phase '{phase}'")))?;
        let accepted_value = match value {
            None => None,
            Some(text) => serde_json::from_str(&text)
                .map_err(|_| Error::CorruptRow("accepted_value is not a JSON list".to_string()))?,
        };
        Ok(Some(ConsensusRecord {
            chunk_id,
            promised_ballot: promised as u64,
            accepted_ballot: accepted as u64,
            accepted_value,
            phase,
        }))
    }

    /// Persist the phase a consensus attempt is entering, before its RPCs
    /// go out.
    pub fn set_consensus_phase(
        &self,
        chunk_id: &str,
        ballot: u64,
        accepted_value: Option<&[String]>,
        phase: ConsensusPhase,
    ) -> Result<()> {
        let value = accepted_value
            .map(|nodes| serde_json::to_string(nodes).expect("string list serializes"));
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO consensus_state
                 (chunk_id, promised_ballot, accepted_ballot, accepted_value, phase)
             VALUES (?1, ?2, ?2, ?3, ?4)",
            params![chunk_id, ballot as i64, value, phase.as_str()],
        )?;
        Ok(())
    }

    /// Undo a proven-failed consensus attempt: drop replica rows written
    /// under `ballot` and reset the record to `none`.
    pub fn cleanup_failed_attempt(&self, chunk_id: &str, ballot: u64) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM chunk_replicas WHERE chunk_id = ?1 AND ballot_number = ?2",
            params![chunk_id, ballot as i64],
        )?;
        tx.execute(
            "UPDATE consensus_state
             SET phase = 'none', accepted_value = NULL
             WHERE chunk_id = ?1",
            params![chunk_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Phase 3 of ChunkPaxos: upsert the chunk row and its placement rows,
    /// refresh `videos.total_chunks`, and mark the consensus record
    /// committed — all in one transaction.
    pub fn commit_placement(&self, commit: &PlacementCommit) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO chunks
                 (chunk_id, video_id, sequence_num, size_bytes, checksum,
                  redundancy_mode, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, CURRENT_TIMESTAMP)",
            params![
                commit.chunk_id,
                commit.video_id,
                commit.sequence_num,
                commit.size_bytes as i64,
                commit.checksum,
                commit.placement.mode().as_str(),
            ],
        )?;

        match &commit.placement {
            Placement::Replicated { nodes } => {
                for node_url in nodes {
                    tx.execute(
                        "INSERT OR REPLACE INTO chunk_replicas
                             (chunk_id, node_url, status, ballot_number, created_at)
                         VALUES (?1, ?2, 'active', ?3, CURRENT_TIMESTAMP)",
                        params![commit.chunk_id, node_url, commit.ballot as i64],
                    )?;
                }
            }
            Placement::Erasure { fragments } => {
                for fragment in fragments {
                    tx.execute(
                        "INSERT OR REPLACE INTO chunk_fragments
                             (fragment_id, chunk_id, fragment_index, node_url,
                              size_bytes, checksum, status, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', CURRENT_TIMESTAMP)",
                        params![
                            fragment.fragment_id,
                            fragment.chunk_id,
                            fragment.fragment_index,
                            fragment.node_url,
                            fragment.size_bytes as i64,
                            fragment.checksum,
                        ],
                    )?;
                }
            }
        }

        tx.execute(
            "UPDATE videos
             SET total_chunks = (
                 SELECT COUNT(DISTINCT chunk_id) FROM chunks WHERE video_id = ?1
             )
             WHERE video_id = ?1",
            params![commit.video_id],
        )?;

        let committed_nodes: Vec<String> = commit
            .placement
            .node_urls()
            .into_iter()
            .map(str::to_string)
            .collect();
        tx.execute(
            "INSERT OR REPLACE INTO consensus_state
                 (chunk_id, promised_ballot, accepted_ballot, accepted_value, phase)
             VALUES (?1, ?2, ?2, ?3, 'committed')",
            params![
                commit.chunk_id,
                commit.ballot as i64,
                serde_json::to_string(&committed_nodes).expect("string list serializes"),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    // Popularity.

    pub fn record_view(&self, video_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO video_stats (video_id, view_count, last_viewed)
             VALUES (?1, 1, CURRENT_TIMESTAMP)
             ON CONFLICT(video_id) DO UPDATE SET
                 view_count = view_count + 1,
                 last_viewed = CURRENT_TIMESTAMP",
            params![video_id],
        )?;
        Ok(())
    }

    pub fn view_count(&self, video_id: &str) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let count: Option<i64> = db
            .query_row(
                "SELECT view_count FROM video_stats WHERE video_id = ?1",
                params![video_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0) as u64)
    }

    // Introspection.

    pub fn service_stats(&self) -> Result<ServiceStats> {
        let db = self.db.lock().unwrap();
        let count = |sql: &str| -> Result<i64> {
            Ok(db.query_row(sql, [], |row| row.get(0))?)
        };
        Ok(ServiceStats {
            total_videos: count("SELECT COUNT(*) FROM videos")?,
            total_chunks: count("SELECT COUNT(*) FROM chunks")?,
            total_replicas: count("SELECT COUNT(*) FROM chunk_replicas WHERE status = 'active'")?,
            total_fragments: count("SELECT COUNT(*) FROM chunk_fragments WHERE status = 'active'")?,
        })
    }

    /// Storage accounting: physical bytes are logical bytes scaled by each
    /// mode's overhead factor, savings are measured against replicating
    /// everything.
    pub fn storage_overhead(
        &self,
        replication_factor: f64,
        erasure_factor: f64,
    ) -> Result<StorageOverhead> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT redundancy_mode, COUNT(*), COALESCE(SUM(size_bytes), 0)
             FROM chunks GROUP BY redundancy_mode",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let (mut replicated, mut erasure) = ((0i64, 0i64), (0i64, 0i64));
        for row in rows {
            let (mode, count, bytes) = row?;
            match RedundancyMode::parse(&mode) {
                Some(RedundancyMode::Replication) => replicated = (count, bytes),
                Some(RedundancyMode::ErasureCoding) => erasure = (count, bytes),
                None => return Err(Error::CorruptRow(format!("redundancy mode '{mode}'"))),
            }
        }

        let logical = replicated.1 + erasure.1;
        let physical =
            (replicated.1 as f64 * replication_factor + erasure.1 as f64 * erasure_factor) as i64;
        let savings = if logical > 0 {
            let baseline = logical as f64 * replication_factor;
            (baseline - physical as f64) / baseline * 100.0
        } else {
            0.0
        };

        Ok(StorageOverhead {
            replication_chunks: replicated.0,
            erasure_coded_chunks: erasure.0,
            total_logical_bytes: logical,
            total_physical_bytes: physical,
            storage_savings_percent: savings,
        })
    }
}

fn collect_nodes(
    rows: impl Iterator<Item = rusqlite::Result<Result<StorageNode>>>,
) -> Result<Vec<StorageNode>> {
    let mut nodes = Vec::new();
    for row in rows {
        nodes.push(row??);
    }
    Ok(nodes)
}

fn fragments_of(db: &Connection, chunk_id: &str) -> Result<Vec<FragmentSpec>> {
    let mut stmt = db.prepare(
        "SELECT fragment_id, chunk_id, fragment_index, node_url, size_bytes, checksum
         FROM chunk_fragments
         WHERE chunk_id = ?1 AND status = 'active'
         ORDER BY fragment_index",
    )?;
    let rows = stmt.query_map(params![chunk_id], |row| {
        Ok(FragmentSpec {
            fragment_id: row.get(0)?,
            chunk_id: row.get(1)?,
            fragment_index: row.get(2)?,
            node_url: row.get(3)?,
            size_bytes: row.get::<_, i64>(4)? as u64,
            checksum: row.get(5)?,
        })
    })?;
    rows.map(|row| row.map_err(Error::from)).collect()
}

fn video_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<VideoRow>> {
    let status: String = row.get(7)?;
    Ok(match VideoStatus::parse(&status) {
        None => Err(Error::CorruptRow(format!("video status '{status}'"))),
        Some(status) => Ok(VideoRow {
            video_id: row.get(0)?,
            title: row.get(1)?,
            duration_sec: row.get(2)?,
            total_chunks: row.get(3)?,
            chunk_duration_sec: row.get(4)?,
            chunk_size_bytes: row.get(5)?,
            created_at: row.get(6)?,
            status,
        }),
    })
}

fn node_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<StorageNode>> {
    let status: String = row.get(5)?;
    Ok(match NodeStatus::parse(&status) {
        None => Err(Error::CorruptRow(format!("node status '{status}'"))),
        Some(status) => Ok(StorageNode {
            node_url: row.get(0)?,
            node_id: row.get(1)?,
            last_heartbeat: row.get(2)?,
            disk_usage_percent: row.get(3)?,
            chunk_count: row.get(4)?,
            status,
            version: row.get(6)?,
        }),
    })
}

fn ttl_modifier(ttl: Duration) -> String {
    format!("-{} seconds", ttl.as_secs())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS videos (
    video_id           TEXT PRIMARY KEY,
    title              TEXT NOT NULL,
    duration_sec       INTEGER NOT NULL,
    total_chunks       INTEGER NOT NULL,
    chunk_duration_sec INTEGER NOT NULL DEFAULT 10,
    chunk_size_bytes   INTEGER NOT NULL DEFAULT 2097152,
    created_at         TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    status             TEXT NOT NULL DEFAULT 'uploading'
);

CREATE TABLE IF NOT EXISTS chunks (
    chunk_id        TEXT PRIMARY KEY,
    video_id        TEXT NOT NULL,
    sequence_num    INTEGER NOT NULL,
    size_bytes      INTEGER NOT NULL,
    checksum        TEXT NOT NULL,
    redundancy_mode TEXT NOT NULL DEFAULT 'replication',
    created_at      TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (video_id) REFERENCES videos(video_id),
    UNIQUE (video_id, sequence_num)
);

CREATE TABLE IF NOT EXISTS chunk_replicas (
    chunk_id      TEXT NOT NULL,
    node_url      TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'active',
    ballot_number INTEGER NOT NULL DEFAULT 0,
    created_at    TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (chunk_id, node_url),
    FOREIGN KEY (chunk_id) REFERENCES chunks(chunk_id)
);

CREATE TABLE IF NOT EXISTS chunk_fragments (
    fragment_id    TEXT PRIMARY KEY,
    chunk_id       TEXT NOT NULL,
    fragment_index INTEGER NOT NULL,
    node_url       TEXT NOT NULL,
    size_bytes     INTEGER NOT NULL,
    checksum       TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'active',
    created_at     TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (chunk_id) REFERENCES chunks(chunk_id),
    UNIQUE (chunk_id, fragment_index)
);

CREATE TABLE IF NOT EXISTS storage_nodes (
    node_url           TEXT PRIMARY KEY,
    node_id            TEXT UNIQUE NOT NULL,
    last_heartbeat     TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    disk_usage_percent REAL NOT NULL DEFAULT 0.0,
    chunk_count        INTEGER NOT NULL DEFAULT 0,
    status             TEXT NOT NULL DEFAULT 'healthy',
    version            TEXT
);

CREATE TABLE IF NOT EXISTS consensus_state (
    chunk_id        TEXT PRIMARY KEY,
    promised_ballot INTEGER NOT NULL DEFAULT 0,
    accepted_ballot INTEGER NOT NULL DEFAULT 0,
    accepted_value  TEXT,
    phase           TEXT NOT NULL DEFAULT 'none'
);

CREATE TABLE IF NOT EXISTS video_stats (
    video_id    TEXT PRIMARY KEY,
    view_count  INTEGER NOT NULL DEFAULT 0,
    last_viewed TIMESTAMP,
    FOREIGN KEY (video_id) REFERENCES videos(video_id)
);

CREATE INDEX IF NOT EXISTS idx_chunks_video_id ON chunks(video_id);
CREATE INDEX IF NOT EXISTS idx_chunk_replicas_chunk_id ON chunk_replicas(chunk_id);
CREATE INDEX IF NOT EXISTS idx_chunk_fragments_chunk_id ON chunk_fragments(chunk_id);
"#;

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn commit_chunk(store: &Store, video_id: &str, seq: u32, nodes: &[&str]) {
        let chunk_id = models::chunk_id(video_id, seq);
        store
            .commit_placement(&PlacementCommit {
                chunk_id,
                video_id: video_id.to_string(),
                sequence_num: seq,
                size_bytes: 2_097_152,
                checksum: "ab".repeat(32),
                ballot: 42,
                placement: Placement::Replicated {
                    nodes: nodes.iter().map(|n| n.to_string()).collect(),
                },
            })
            .unwrap();
    }

    #[test]
    fn video_lifecycle() {
        let store = store();
        store.create_video("v1", "a title", 120, 10, 2_097_152).unwrap();

        let video = store.video("v1").unwrap().unwrap();
        assert_eq!(video.title, "a title");
        assert_eq!(video.status, VideoStatus::Uploading);
        assert_eq!(video.total_chunks, 0);

        store.update_video_status("v1", VideoStatus::Active).unwrap();
        assert_eq!(store.video("v1").unwrap().unwrap().status, VideoStatus::Active);

        assert!(matches!(
            store.update_video_status("missing", VideoStatus::Active),
            Err(Error::VideoNotFound(_))
        ));
        assert!(store.video("missing").unwrap().is_none());
    }

    #[test]
    fn commit_maintains_total_chunks() {
        let store = store();
        store.create_video("v1", "t", 120, 10, 2_097_152).unwrap();

        commit_chunk(&store, "v1", 0, &["http://n1", "http://n2", "http://n3"]);
        assert_eq!(store.video("v1").unwrap().unwrap().total_chunks, 1);

        commit_chunk(&store, "v1", 1, &["http://n1", "http://n2", "http://n3"]);
        assert_eq!(store.video("v1").unwrap().unwrap().total_chunks, 2);

        // Re-committing the same chunk is idempotent for the count.
        commit_chunk(&store, "v1", 1, &["http://n1", "http://n2"]);
        assert_eq!(store.video("v1").unwrap().unwrap().total_chunks, 2);
    }

    #[test]
    fn manifest_reflects_committed_placements() {
        let store = store();
        store.create_video("v1", "t", 120, 10, 2_097_152).unwrap();
        commit_chunk(&store, "v1", 0, &["http://n1", "http://n2", "http://n3"]);

        let fragments: Vec<FragmentSpec> = (0..5)
            .map(|i| FragmentSpec {
                fragment_id: format!("v1-chunk-001-frag-{i}"),
                chunk_id: "v1-chunk-001".to_string(),
                fragment_index: i,
                node_url: format!("http://n{}", i + 1),
                size_bytes: 699_051,
                checksum: "cd".repeat(32),
            })
            .collect();
        store
            .commit_placement(&PlacementCommit {
                chunk_id: "v1-chunk-001".to_string(),
                video_id: "v1".to_string(),
                sequence_num: 1,
                size_bytes: 2_097_152,
                checksum: "ab".repeat(32),
                ballot: 43,
                placement: Placement::Erasure { fragments },
            })
            .unwrap();

        let manifest = store.video_manifest("v1").unwrap().unwrap();
        assert_eq!(manifest.total_chunks, 2);
        assert_eq!(manifest.chunks.len(), 2);

        let replicated = &manifest.chunks[0];
        assert_eq!(replicated.sequence_num, 0);
        assert_eq!(replicated.replicas.len(), 3);
        assert!(replicated.fragments.is_none());

        let erasure = &manifest.chunks[1];
        assert_eq!(erasure.redundancy_mode, RedundancyMode::ErasureCoding);
        assert!(erasure.replicas.is_empty());
        assert_eq!(erasure.fragments.as_ref().unwrap().len(), 5);

        assert!(store.video_manifest("missing").unwrap().is_none());
    }

    #[test]
    fn consensus_record_round_trip_and_cleanup() {
        let store = store();
        store.create_video("v1", "t", 120, 10, 2_097_152).unwrap();

        store
            .set_consensus_phase("v1-chunk-000", 7, None, ConsensusPhase::Prepare)
            .unwrap();
        let record = store.consensus_record("v1-chunk-000").unwrap().unwrap();
        assert_eq!(record.phase, ConsensusPhase::Prepare);
        assert_eq!(record.promised_ballot, 7);
        assert!(record.accepted_value.is_none());

        let nodes = vec!["http://n1".to_string(), "http://n2".to_string()];
        store
            .set_consensus_phase("v1-chunk-000", 7, Some(&nodes), ConsensusPhase::Accept)
            .unwrap();
        let record = store.consensus_record("v1-chunk-000").unwrap().unwrap();
        assert_eq!(record.phase, ConsensusPhase::Accept);
        assert_eq!(record.accepted_value.as_deref(), Some(&nodes[..]));

        commit_chunk(&store, "v1", 0, &["http://n1", "http://n2"]);
        let record = store.consensus_record("v1-chunk-000").unwrap().unwrap();
        assert_eq!(record.phase, ConsensusPhase::Committed);

        // Cleanup of a failed ballot removes its replicas and resets phase.
        store.cleanup_failed_attempt("v1-chunk-000", 42).unwrap();
        let record = store.consensus_record("v1-chunk-000").unwrap().unwrap();
        assert_eq!(record.phase, ConsensusPhase::None);
        let manifest = store.video_manifest("v1").unwrap().unwrap();
        assert!(manifest.chunks[0].replicas.is_empty());
    }

    #[test]
    fn node_heartbeats_and_ttl() {
        let store = store();
        let ttl = Duration::from_secs(60);

        store.register_node("http://n1:8081", "n1", "1.0.0").unwrap();
        store.register_node("http://n2:8081", "n2", "1.0.0").unwrap();
        store.record_heartbeat("n1", 40.0, 12).unwrap();

        let healthy = store.healthy_nodes(ttl).unwrap();
        assert_eq!(healthy.len(), 2);

        // n2 went quiet for two minutes.
        store.backdate_heartbeat("n2", 120).unwrap();
        let marked = store.mark_stale_nodes_down(ttl).unwrap();
        assert_eq!(marked, vec!["http://n2:8081".to_string()]);

        let healthy = store.healthy_nodes(ttl).unwrap();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].node_id, "n1");

        let summary = store.node_health_summary().unwrap();
        assert_eq!(summary.get("healthy"), Some(&1));
        assert_eq!(summary.get("down"), Some(&1));

        // A fresh heartbeat revives the node.
        store.record_heartbeat("n2", 10.0, 3).unwrap();
        assert_eq!(store.healthy_nodes(ttl).unwrap().len(), 2);

        assert!(matches!(
            store.record_heartbeat("ghost", 0.0, 0),
            Err(Error::NodeNotFound(_))
        ));
    }

    #[test]
    fn view_counts_accumulate() {
        let store = store();
        store.create_video("v1", "t", 120, 10, 2_097_152).unwrap();

        assert_eq!(store.view_count("v1").unwrap(), 0);
        store.record_view("v1").unwrap();
        store.record_view("v1").unwrap();
        assert_eq!(store.view_count("v1").unwrap(), 2);
    }

    #[test]
    fn storage_overhead_accounting() {
        let store = store();
        store.create_video("v1", "t", 120, 10, 2_097_152).unwrap();
        commit_chunk(&store, "v1", 0, &["http://n1", "http://n2", "http://n3"]);

        let overhead = store.storage_overhead(3.0, 5.0 / 3.0).unwrap();
        assert_eq!(overhead.replication_chunks, 1);
        assert_eq!(overhead.erasure_coded_chunks, 0);
        assert_eq!(overhead.total_logical_bytes, 2_097_152);
        assert_eq!(overhead.total_physical_bytes, 3 * 2_097_152);
        assert!((overhead.storage_savings_percent - 0.0).abs() < 1e-9);

        let stats = store.service_stats().unwrap();
        assert_eq!(stats.total_videos, 1);
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.total_replicas, 3);
    }
}
