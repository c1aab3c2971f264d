//! Logical replication wire protocol: LSNs, copy-data chunk framing, the
//! pgoutput logical message layout, and standby status update encoding.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Microseconds between the Unix epoch and 2000-01-01, the epoch replication
/// timestamps are expressed in.
pub const PG_EPOCH_OFFSET_US: i64 = 946_684_800_000_000;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("truncated message: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("unknown replication message type: 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error("unknown logical message tag: '{0}'")]
    UnknownTag(char),
    #[error("unknown tuple column kind: '{0}'")]
    UnknownColumnKind(char),
    #[error("invalid utf-8 in message")]
    InvalidUtf8,
    #[error("invalid lsn: {0}")]
    InvalidLsn(String),
}

/// Position in the upstream transaction log. Displayed `XXXXXXXX/YYYYYYYY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub fn new(hi: u32, lo: u32) -> Self {
        Lsn(((hi as u64) << 32) | lo as u64)
    }

    pub fn hi(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn lo(&self) -> u32 {
        self.0 as u32
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| ProtocolError::InvalidLsn(s.to_string()))?;
        let hi = u32::from_str_radix(hi, 16)
            .map_err(|_| ProtocolError::InvalidLsn(s.to_string()))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|_| ProtocolError::InvalidLsn(s.to_string()))?;
        Ok(Lsn::new(hi, lo))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.hi(), self.lo())
    }
}

/// A raw copy-data chunk, dispatched by its leading byte.
#[derive(Debug, Clone)]
pub enum ReplicationMessage {
    /// 0x77: embedded logical-decoding payload.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        send_time_us: i64,
        payload: Bytes,
    },
    /// 0x6b: primary keepalive.
    PrimaryKeepalive {
        wal_end: Lsn,
        send_time_us: i64,
        reply_requested: bool,
    },
}

fn need(buf: &Bytes, n: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        Err(ProtocolError::Truncated {
            needed: n - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

pub fn parse_replication_message(chunk: &[u8]) -> Result<ReplicationMessage, ProtocolError> {
    let mut buf = Bytes::copy_from_slice(chunk);
    need(&buf, 1)?;
    match buf.get_u8() {
        0x77 => {
            need(&buf, 24)?;
            let wal_start = Lsn(buf.get_u64());
            let wal_end = Lsn(buf.get_u64());
            let send_time_us = buf.get_i64();
            Ok(ReplicationMessage::XLogData {
                wal_start,
                wal_end,
                send_time_us,
                payload: buf,
            })
        }
        0x6b => {
            need(&buf, 17)?;
            let wal_end = Lsn(buf.get_u64());
            let send_time_us = buf.get_i64();
            let reply_requested = buf.get_u8() != 0;
            Ok(ReplicationMessage::PrimaryKeepalive {
                wal_end,
                send_time_us,
                reply_requested,
            })
        }
        other => Err(ProtocolError::UnknownMessageType(other)),
    }
}

/// Standby status update: type byte `'r'`, received/flushed/applied WAL
/// positions, timestamp in microseconds since 2000-01-01, reply flag.
pub fn encode_standby_status_update(
    received: Lsn,
    flushed: Lsn,
    applied: Lsn,
    now_unix_ms: i64,
    reply_requested: bool,
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(received.0);
    buf.put_u64(flushed.0);
    buf.put_u64(applied.0);
    buf.put_i64(now_unix_ms * 1000 - PG_EPOCH_OFFSET_US);
    buf.put_u8(reply_requested as u8);
    buf.to_vec()
}

// ---------------------------------------------------------------------------
// pgoutput logical messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_oid: u32,
    pub is_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationInfo {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

/// One column of a tuple as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    /// 'n'
    Null,
    /// 'u': unchanged toasted value, omitted from the message.
    Unchanged,
    /// 't': textual representation.
    Text(String),
}

pub type TupleData = Vec<ColumnValue>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalMessage {
    Begin {
        final_lsn: Lsn,
        commit_time_us: i64,
        xid: u32,
    },
    Commit {
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time_us: i64,
    },
    Relation(RelationInfo),
    Insert {
        relation_id: u32,
        new_tuple: TupleData,
    },
    Update {
        relation_id: u32,
        old_tuple: Option<TupleData>,
        new_tuple: TupleData,
    },
    Delete {
        relation_id: u32,
        old_tuple: TupleData,
    },
}

fn get_cstr(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let Some(end) = buf.iter().position(|b| *b == 0) else {
        return Err(ProtocolError::Truncated { needed: 1 });
    };
    let raw = buf.split_to(end);
    buf.advance(1); // terminator
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

fn parse_tuple(buf: &mut Bytes) -> Result<TupleData, ProtocolError> {
    need(buf, 2)?;
    let column_count = buf.get_u16() as usize;
    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        need(buf, 1)?;
        match buf.get_u8() {
            b'n' => columns.push(ColumnValue::Null),
            b'u' => columns.push(ColumnValue::Unchanged),
            b't' => {
                need(buf, 4)?;
                let len = buf.get_u32() as usize;
                need(buf, len)?;
                let raw = buf.split_to(len);
                columns.push(ColumnValue::Text(
                    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?,
                ));
            }
            other => return Err(ProtocolError::UnknownColumnKind(other as char)),
        }
    }
    Ok(columns)
}

pub fn parse_logical_message(payload: &[u8]) -> Result<LogicalMessage, ProtocolError> {
    let mut buf = Bytes::copy_from_slice(payload);
    need(&buf, 1)?;
    match buf.get_u8() {
        b'B' => {
            need(&buf, 20)?;
            let final_lsn = Lsn(buf.get_u64());
            let commit_time_us = buf.get_i64();
            let xid = buf.get_u32();
            Ok(LogicalMessage::Begin {
                final_lsn,
                commit_time_us,
                xid,
            })
        }
        b'C' => {
            need(&buf, 25)?;
            let _flags = buf.get_u8();
            let commit_lsn = Lsn(buf.get_u64());
            let end_lsn = Lsn(buf.get_u64());
            let commit_time_us = buf.get_i64();
            Ok(LogicalMessage::Commit {
                commit_lsn,
                end_lsn,
                commit_time_us,
            })
        }
        b'R' => {
            need(&buf, 4)?;
            let id = buf.get_u32();
            let namespace = get_cstr(&mut buf)?;
            let name = get_cstr(&mut buf)?;
            need(&buf, 3)?;
            let _replica_identity = buf.get_u8();
            let column_count = buf.get_u16() as usize;
            let mut columns = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                need(&buf, 1)?;
                let flags = buf.get_u8();
                let column_name = get_cstr(&mut buf)?;
                need(&buf, 8)?;
                let type_oid = buf.get_u32();
                let _type_modifier = buf.get_u32();
                columns.push(ColumnInfo {
                    name: column_name,
                    type_oid,
                    is_key: flags & 1 != 0,
                });
            }
            Ok(LogicalMessage::Relation(RelationInfo {
                id,
                namespace,
                name,
                columns,
            }))
        }
        b'I' => {
            need(&buf, 5)?;
            let relation_id = buf.get_u32();
            let kind = buf.get_u8();
            if kind != b'N' {
                return Err(ProtocolError::UnknownColumnKind(kind as char));
            }
            let new_tuple = parse_tuple(&mut buf)?;
            Ok(LogicalMessage::Insert {
                relation_id,
                new_tuple,
            })
        }
        b'U' => {
            need(&buf, 5)?;
            let relation_id = buf.get_u32();
            let mut kind = buf.get_u8();
            // Old tuple (or key) is optional, indicated by 'O'/'K'.
            let old_tuple = if kind == b'O' || kind == b'K' {
                let old = parse_tuple(&mut buf)?;
                need(&buf, 1)?;
                kind = buf.get_u8();
                Some(old)
            } else {
                None
            };
            if kind != b'N' {
                return Err(ProtocolError::UnknownColumnKind(kind as char));
            }
            let new_tuple = parse_tuple(&mut buf)?;
            Ok(LogicalMessage::Update {
                relation_id,
                old_tuple,
                new_tuple,
            })
        }
        b'D' => {
            need(&buf, 5)?;
            let relation_id = buf.get_u32();
            let kind = buf.get_u8();
            if kind != b'O' && kind != b'K' {
                return Err(ProtocolError::UnknownColumnKind(kind as char));
            }
            let old_tuple = parse_tuple(&mut buf)?;
            Ok(LogicalMessage::Delete {
                relation_id,
                old_tuple,
            })
        }
        other => Err(ProtocolError::UnknownTag(other as char)),
    }
}

/// Monotonic version derived from an LSN, used as a last-writer-wins
/// tiebreaker in the destination store.
pub fn version_from_lsn(lsn: Lsn) -> u64 {
    ((lsn.hi() as u64) << 32) | lsn.lo() as u64
}

/// Replication timestamp (µs since 2000) to Unix milliseconds.
pub fn pg_time_to_unix_ms(send_time_us: i64) -> i64 {
    (send_time_us + PG_EPOCH_OFFSET_US) / 1000
}
