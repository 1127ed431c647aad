//! Binary log-entry format.
//!
//! Canonical encoding for replicated log entries, shared by the in-process
//! log and any durable transport. Every entry starts with a fixed header:
//!
//! ```text
//! Offset  Size  Field
//! 0       8     term: u64 LE
//! 8       2     shard: u16 LE
//! 10      8     hlc.l: u64 LE
//! 18      4     hlc.c: u32 LE
//! 22      1     cmd_tag: u8
//! 23      ..    command body (tag-specific)
//! ```
//!
//! Strings are u16-length-prefixed UTF-8; node ids are u32 with 0 encoding
//! the NULL sentinel; sequences are u32-count-prefixed. A transaction's
//! participant set travels as a u32 bitset. The `state_transfer` payload is
//! a u32-length-prefixed bincode-encoded node record. Decoding rejects
//! unknown tags, truncated bodies, and trailing bytes.

use std::collections::BTreeMap;

use crate::consensus::{Command, LogEntry};
use crate::error::{Result, SceneError};
use crate::hlc::HlcTimestamp;
use crate::scene::{NodeId, PropertyUpdate, SceneOp};
use crate::shard::ShardId;
use crate::txn::{RoutedOp, TxnRecord, TxnStatus};

// ── Command tags ───────────────────────────────────────────────────────

const TAG_ADD_CHILD: u8 = 0x01;
const TAG_ADD_SIBLING: u8 = 0x02;
const TAG_REMOVE_NODE: u8 = 0x03;
const TAG_SET_PROPERTY: u8 = 0x04;
const TAG_MOVE_SUBTREE: u8 = 0x05;
const TAG_MOVE_CHILD: u8 = 0x06;
const TAG_BATCH_UPDATE: u8 = 0x07;
const TAG_BATCH_STRUCTURE: u8 = 0x08;
const TAG_STATE_TRANSFER: u8 = 0x09;
const TAG_SHARD_REMOVE: u8 = 0x0A;
const TAG_DETACH_CHILD: u8 = 0x0B;
const TAG_ATTACH_CHILD: u8 = 0x0C;
const TAG_TXN_INTENT: u8 = 0x10;
const TAG_TXN_COMMIT: u8 = 0x11;
const TAG_TXN_ABORT: u8 = 0x12;

const STATUS_COMMITTING: u8 = 0;
const STATUS_COMMITTED: u8 = 1;
const STATUS_ABORTED: u8 = 2;

// ── Encoding ───────────────────────────────────────────────────────────

pub fn encode_entry(entry: &LogEntry) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&entry.term.to_le_bytes());
    buf.extend_from_slice(&entry.shard.to_le_bytes());
    buf.extend_from_slice(&entry.hlc.l.to_le_bytes());
    buf.extend_from_slice(&entry.hlc.c.to_le_bytes());
    encode_command(&mut buf, &entry.cmd)?;
    Ok(buf)
}

fn encode_command(buf: &mut Vec<u8>, cmd: &Command) -> Result<()> {
    match cmd {
        Command::Scene(op) => encode_op(buf, op)?,
        Command::TxnIntent(record) => {
            buf.push(TAG_TXN_INTENT);
            encode_txn_record(buf, record)?;
        }
        Command::TxnCommit { txn_id, hlc } => {
            buf.push(TAG_TXN_COMMIT);
            buf.extend_from_slice(&txn_id.to_le_bytes());
            buf.extend_from_slice(&hlc.l.to_le_bytes());
            buf.extend_from_slice(&hlc.c.to_le_bytes());
        }
        Command::TxnAbort { txn_id } => {
            buf.push(TAG_TXN_ABORT);
            buf.extend_from_slice(&txn_id.to_le_bytes());
        }
    }
    Ok(())
}

fn encode_op(buf: &mut Vec<u8>, op: &SceneOp) -> Result<()> {
    match op {
        SceneOp::AddChild {
            target,
            new_node,
            properties,
        } => {
            buf.push(TAG_ADD_CHILD);
            put_node_opt(buf, *target);
            put_node(buf, *new_node);
            put_props(buf, properties);
        }
        SceneOp::AddSibling {
            target,
            new_node,
            properties,
        } => {
            buf.push(TAG_ADD_SIBLING);
            put_node(buf, *target);
            put_node(buf, *new_node);
            put_props(buf, properties);
        }
        SceneOp::RemoveNode { node } => {
            buf.push(TAG_REMOVE_NODE);
            put_node(buf, *node);
        }
        SceneOp::SetProperty { node, key, value } => {
            buf.push(TAG_SET_PROPERTY);
            put_node(buf, *node);
            put_str(buf, key);
            put_str(buf, value);
        }
        SceneOp::MoveSubtree {
            node,
            new_parent,
            new_sibling,
        } => {
            buf.push(TAG_MOVE_SUBTREE);
            put_node(buf, *node);
            put_node(buf, *new_parent);
            put_node_opt(buf, *new_sibling);
        }
        SceneOp::MoveChild {
            parent,
            child_node,
            to_index,
        } => {
            buf.push(TAG_MOVE_CHILD);
            put_node(buf, *parent);
            put_node(buf, *child_node);
            buf.extend_from_slice(&to_index.to_le_bytes());
        }
        SceneOp::BatchUpdate { updates } => {
            buf.push(TAG_BATCH_UPDATE);
            buf.extend_from_slice(&(updates.len() as u32).to_le_bytes());
            for update in updates {
                put_node(buf, update.node);
                put_str(buf, &update.key);
                put_str(buf, &update.value);
            }
        }
        SceneOp::BatchStructure { structure_ops } => {
            buf.push(TAG_BATCH_STRUCTURE);
            buf.extend_from_slice(&(structure_ops.len() as u32).to_le_bytes());
            for nested in structure_ops {
                encode_op(buf, nested)?;
            }
        }
        SceneOp::StateTransfer { node, state } => {
            buf.push(TAG_STATE_TRANSFER);
            put_node(buf, *node);
            // Opaque payload; bincode keeps the record layout out of the
            // wire format.
            let payload = bincode::serialize(state)?;
            buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            buf.extend_from_slice(&payload);
        }
        SceneOp::ShardRemove { node } => {
            buf.push(TAG_SHARD_REMOVE);
            put_node(buf, *node);
        }
        SceneOp::DetachChild { parent, child } => {
            buf.push(TAG_DETACH_CHILD);
            put_node(buf, *parent);
            put_node(buf, *child);
        }
        SceneOp::AttachChild {
            new_parent,
            child,
            position,
        } => {
            buf.push(TAG_ATTACH_CHILD);
            put_node_opt(buf, *new_parent);
            put_node(buf, *child);
            buf.extend_from_slice(&position.to_le_bytes());
        }
    }
    Ok(())
}

fn encode_txn_record(buf: &mut Vec<u8>, record: &TxnRecord) -> Result<()> {
    buf.extend_from_slice(&record.txn_id.to_le_bytes());
    buf.push(match record.status {
        TxnStatus::Committing => STATUS_COMMITTING,
        TxnStatus::Committed => STATUS_COMMITTED,
        TxnStatus::Aborted => STATUS_ABORTED,
    });
    let mut bitset: u32 = 0;
    for &shard in &record.shards {
        bitset |= 1 << shard;
    }
    buf.extend_from_slice(&bitset.to_le_bytes());
    buf.extend_from_slice(&record.coord_shard.to_le_bytes());
    buf.extend_from_slice(&record.hlc.l.to_le_bytes());
    buf.extend_from_slice(&record.hlc.c.to_le_bytes());
    buf.extend_from_slice(&(record.ops.len() as u32).to_le_bytes());
    for routed in &record.ops {
        buf.extend_from_slice(&routed.shard.to_le_bytes());
        encode_op(buf, &routed.op)?;
    }
    Ok(())
}

#[inline]
fn put_node(buf: &mut Vec<u8>, node: NodeId) {
    buf.extend_from_slice(&node.to_le_bytes());
}

#[inline]
fn put_node_opt(buf: &mut Vec<u8>, node: Option<NodeId>) {
    buf.extend_from_slice(&node.unwrap_or(0).to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_props(buf: &mut Vec<u8>, props: &BTreeMap<String, String>) {
    buf.extend_from_slice(&(props.len() as u32).to_le_bytes());
    for (key, value) in props {
        put_str(buf, key);
        put_str(buf, value);
    }
}

// ── Decoding ───────────────────────────────────────────────────────────

pub fn decode_entry(frame: &[u8]) -> Result<LogEntry> {
    let mut r = Reader::new(frame);
    let term = r.u64()?;
    let shard: ShardId = r.u16()?;
    let hlc = HlcTimestamp::new(r.u64()?, r.u32()?);
    let cmd = decode_command(&mut r)?;
    r.finish()?;
    Ok(LogEntry {
        term,
        shard,
        hlc,
        cmd,
    })
}

fn decode_command(r: &mut Reader<'_>) -> Result<Command> {
    let tag = r.u8()?;
    match tag {
        TAG_TXN_INTENT => Ok(Command::TxnIntent(decode_txn_record(r)?)),
        TAG_TXN_COMMIT => Ok(Command::TxnCommit {
            txn_id: r.u64()?,
            hlc: HlcTimestamp::new(r.u64()?, r.u32()?),
        }),
        TAG_TXN_ABORT => Ok(Command::TxnAbort { txn_id: r.u64()? }),
        _ => Ok(Command::Scene(decode_op_body(tag, r)?)),
    }
}

fn decode_op(r: &mut Reader<'_>) -> Result<SceneOp> {
    let tag = r.u8()?;
    decode_op_body(tag, r)
}

fn decode_op_body(tag: u8, r: &mut Reader<'_>) -> Result<SceneOp> {
    match tag {
        TAG_ADD_CHILD => Ok(SceneOp::AddChild {
            target: r.node_opt()?,
            new_node: r.node()?,
            properties: r.props()?,
        }),
        TAG_ADD_SIBLING => Ok(SceneOp::AddSibling {
            target: r.node()?,
            new_node: r.node()?,
            properties: r.props()?,
        }),
        TAG_REMOVE_NODE => Ok(SceneOp::RemoveNode { node: r.node()? }),
        TAG_SET_PROPERTY => Ok(SceneOp::SetProperty {
            node: r.node()?,
            key: r.string()?,
            value: r.string()?,
        }),
        TAG_MOVE_SUBTREE => Ok(SceneOp::MoveSubtree {
            node: r.node()?,
            new_parent: r.node()?,
            new_sibling: r.node_opt()?,
        }),
        TAG_MOVE_CHILD => Ok(SceneOp::MoveChild {
            parent: r.node()?,
            child_node: r.node()?,
            to_index: r.i64()?,
        }),
        TAG_BATCH_UPDATE => {
            let count = r.u32()? as usize;
            let mut updates = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                updates.push(PropertyUpdate {
                    node: r.node()?,
                    key: r.string()?,
                    value: r.string()?,
                });
            }
            Ok(SceneOp::BatchUpdate { updates })
        }
        TAG_BATCH_STRUCTURE => {
            let count = r.u32()? as usize;
            let mut structure_ops = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                structure_ops.push(decode_op(r)?);
            }
            Ok(SceneOp::BatchStructure { structure_ops })
        }
        TAG_STATE_TRANSFER => {
            let node = r.node()?;
            let len = r.u32()? as usize;
            let payload = r.bytes(len)?;
            let state = bincode::deserialize(payload)?;
            Ok(SceneOp::StateTransfer { node, state })
        }
        TAG_SHARD_REMOVE => Ok(SceneOp::ShardRemove { node: r.node()? }),
        TAG_DETACH_CHILD => Ok(SceneOp::DetachChild {
            parent: r.node()?,
            child: r.node()?,
        }),
        TAG_ATTACH_CHILD => Ok(SceneOp::AttachChild {
            new_parent: r.node_opt()?,
            child: r.node()?,
            position: r.u32()?,
        }),
        _ => Err(SceneError::InvalidFormat(format!(
            "unknown command tag 0x{:02X}",
            tag
        ))),
    }
}

fn decode_txn_record(r: &mut Reader<'_>) -> Result<TxnRecord> {
    let txn_id = r.u64()?;
    let status = match r.u8()? {
        STATUS_COMMITTING => TxnStatus::Committing,
        STATUS_COMMITTED => TxnStatus::Committed,
        STATUS_ABORTED => TxnStatus::Aborted,
        other => {
            return Err(SceneError::InvalidFormat(format!(
                "unknown txn status {}",
                other
            )))
        }
    };
    let bitset = r.u32()?;
    let shards: Vec<ShardId> = (0..32).filter(|s| bitset & (1 << s) != 0).collect();
    let coord_shard = r.u16()?;
    let hlc = HlcTimestamp::new(r.u64()?, r.u32()?);
    let count = r.u32()? as usize;
    let mut ops = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let shard = r.u16()?;
        let op = decode_op(r)?;
        ops.push(RoutedOp { shard, op });
    }
    Ok(TxnRecord {
        txn_id,
        status,
        shards,
        coord_shard,
        hlc,
        ops,
    })
}

// ── Cursor reader ──────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(SceneError::InvalidFormat(format!(
                "truncated entry: wanted {} bytes at offset {}",
                len, self.pos
            ))),
        }
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn node(&mut self) -> Result<NodeId> {
        self.u32()
    }

    fn node_opt(&mut self) -> Result<Option<NodeId>> {
        let raw = self.u32()?;
        Ok((raw != 0).then_some(raw))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| SceneError::InvalidFormat("non-UTF-8 string".into()))
    }

    fn props(&mut self) -> Result<BTreeMap<String, String>> {
        let count = self.u32()? as usize;
        let mut props = BTreeMap::new();
        for _ in 0..count {
            let key = self.string()?;
            let value = self.string()?;
            props.insert(key, value);
        }
        Ok(props)
    }

    fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(SceneError::InvalidFormat(format!(
                "{} trailing bytes after entry",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}
