//! Message payloads (§4.1): one variant per command the core speaks, plus
//! their encode/decode implementations.

use crate::codec::varint::{read_var_bytes, read_var_str, read_varint, write_var_bytes, write_var_str, write_varint};
use crate::error::CodecError;
use crate::hash::Hash256;
use crate::header::BlockHeader;
use crate::inventory::{InventoryItem, InventoryKind};
use crate::locator::BlockLocator;
use bytes::{Buf, BufMut, BytesMut};
use std::net::{IpAddr, Ipv6Addr};

/// Protocol version at or above which filtered blocks (the `bloom`/
/// `merkleblock` family) are supported (§6).
pub const MIN_FILTERED_BLOCK_VERSION: u32 = 70001;

/// Node service flags (§3.1).
pub const SERVICE_NODE_NETWORK: u64 = 0x1;

/// A peer network address. Inside `version` it omits the leading timestamp;
/// inside `addr` it is included (§4.1, §3.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkAddress {
    pub timestamp: Option<u32>,
    pub services: u64,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(services: u64, ip: IpAddr, port: u16, timestamp: Option<u32>) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            timestamp,
            services,
            ip,
            port,
        }
    }

    fn encode(&self, buf: &mut impl BufMut, with_timestamp: bool) {
        if with_timestamp {
            buf.put_u32_le(self.timestamp.unwrap_or(0));
        }
        buf.put_u64_le(self.services);
        buf.put_slice(&self.ip.octets());
        buf.put_u16(self.port); // port is big-endian on the wire
    }

    fn decode(buf: &mut impl Buf, with_timestamp: bool) -> Result<Self, CodecError> {
        let timestamp = if with_timestamp {
            require(buf, 4)?;
            Some(buf.get_u32_le())
        } else {
            None
        };
        require(buf, 26)?;
        let services = buf.get_u64_le();
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        let port = buf.get_u16();
        Ok(Self {
            timestamp,
            services,
            ip: Ipv6Addr::from(octets),
            port,
        })
    }
}

/// Reasons a peer can give in a `reject` message (§3.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    NonStandard,
    CheckpointMismatch,
    Other(u8),
}

impl RejectCode {
    fn wire(self) -> u8 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::NonStandard => 0x40,
            RejectCode::CheckpointMismatch => 0x43,
            RejectCode::Other(c) => c,
        }
    }

    fn from_wire(code: u8) -> Self {
        match code {
            0x01 => RejectCode::Malformed,
            0x10 => RejectCode::Invalid,
            0x11 => RejectCode::Obsolete,
            0x12 => RejectCode::Duplicate,
            0x40 => RejectCode::NonStandard,
            0x43 => RejectCode::CheckpointMismatch,
            other => RejectCode::Other(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectPayload {
    pub rejected_command: String,
    pub code: RejectCode,
    pub reason: String,
    pub extra_data: Option<Hash256>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionPayload {
    pub protocol_version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetworkAddress,
    pub sender: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: u32,
    pub relay: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FilterLoadPayload {
    pub filter: Vec<u8>,
    pub num_hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

/// The full set of messages the core speaks (§4.1). Each variant is the
/// decoded payload for one command; `Message::command()` gives the 12-byte
/// ASCII command name used to frame it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    Verack,
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Addr(Vec<NetworkAddress>),
    Inv(Vec<InventoryItem>),
    GetData(Vec<InventoryItem>),
    NotFound(Vec<InventoryItem>),
    GetHeaders { locator: BlockLocator, hash_stop: Hash256 },
    Headers(Vec<BlockHeader>),
    GetBlocks { locator: BlockLocator, hash_stop: Hash256 },
    Block(Vec<u8>),
    MerkleBlock { header: BlockHeader, tree: crate::merkle::PartialMerkleTree },
    Tx(Vec<u8>),
    MemPool,
    FilterLoad(FilterLoadPayload),
    FilterAdd(Vec<u8>),
    FilterClear,
    Reject(RejectPayload),
    GetAddr,
}

const MAX_INVENTORY_ITEMS: usize = 50_000;
const MAX_HEADERS: usize = 2_000;
const MAX_ADDR_ENTRIES: usize = 1_000;
const MAX_USER_AGENT_LEN: usize = 256;
const MAX_FILTER_LEN: usize = 36_000;
const MAX_SCRIPT_LEN: usize = 10_000;
const MAX_RAW_TX_LEN: usize = 4 * 1024 * 1024;
const MAX_MERKLE_HASHES: usize = 1_000_000;
const MAX_MERKLE_FLAG_BYTES: usize = 125_000;

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::GetBlocks { .. } => "getblocks",
            Message::Block(_) => "block",
            Message::MerkleBlock { .. } => "merkleblock",
            Message::Tx(_) => "tx",
            Message::MemPool => "mempool",
            Message::FilterLoad(_) => "filterload",
            Message::FilterAdd(_) => "filteradd",
            Message::FilterClear => "filterclear",
            Message::Reject(_) => "reject",
            Message::GetAddr => "getaddr",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            Message::Version(v) => {
                buf.put_u32_le(v.protocol_version);
                buf.put_u64_le(v.services);
                buf.put_i64_le(v.timestamp);
                v.receiver.encode(&mut buf, false);
                v.sender.encode(&mut buf, false);
                buf.put_u64_le(v.nonce);
                write_var_str(&mut buf, &v.user_agent);
                buf.put_u32_le(v.start_height);
                buf.put_u8(v.relay as u8);
            }
            Message::Verack | Message::MemPool | Message::FilterClear | Message::GetAddr => {}
            Message::Ping { nonce } | Message::Pong { nonce } => buf.put_u64_le(*nonce),
            Message::Addr(addrs) => {
                write_varint(&mut buf, addrs.len() as u64);
                for a in addrs {
                    a.encode(&mut buf, true);
                }
            }
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                write_varint(&mut buf, items.len() as u64);
                for item in items {
                    buf.put_u32_le(item.kind.wire_code());
                    buf.put_slice(&item.hash.0);
                }
            }
            Message::GetHeaders { locator, hash_stop } | Message::GetBlocks { locator, hash_stop } => {
                buf.put_u32_le(0); // protocol version, unused by the SPV core
                write_varint(&mut buf, locator.block_ids.len() as u64);
                for id in &locator.block_ids {
                    buf.put_slice(&id.0);
                }
                buf.put_slice(&hash_stop.0);
            }
            Message::Headers(headers) => {
                write_varint(&mut buf, headers.len() as u64);
                for h in headers {
                    buf.put_slice(&h.encode());
                    write_varint(&mut buf, 0); // tx_count, always 0 in a headers-only message
                }
            }
            Message::Block(raw) | Message::Tx(raw) => buf.put_slice(raw),
            Message::MerkleBlock { header, tree } => {
                buf.put_slice(&header.encode());
                buf.put_u32_le(tree.tx_count);
                write_varint(&mut buf, tree.hashes.len() as u64);
                for h in &tree.hashes {
                    buf.put_slice(&h.0);
                }
                write_var_bytes(&mut buf, &tree.flags);
            }
            Message::FilterLoad(f) => {
                write_var_bytes(&mut buf, &f.filter);
                buf.put_u32_le(f.num_hash_funcs);
                buf.put_u32_le(f.tweak);
                buf.put_u8(f.flags);
            }
            Message::FilterAdd(data) => write_var_bytes(&mut buf, data),
            Message::Reject(r) => {
                write_var_str(&mut buf, &r.rejected_command);
                buf.put_u8(r.code.wire());
                write_var_str(&mut buf, &r.reason);
                if let Some(extra) = r.extra_data {
                    buf.put_slice(&extra.0);
                }
            }
        }
        buf.to_vec()
    }

    /// Decode a payload given its command name, per §4.1.
    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Message, CodecError> {
        let mut buf = payload;
        let msg = match command {
            "version" => {
                let protocol_version = take_u32(&mut buf)?;
                let services = take_u64(&mut buf)?;
                let timestamp = take_i64(&mut buf)?;
                let receiver = NetworkAddress::decode(&mut buf, false)?;
                let sender = NetworkAddress::decode(&mut buf, false)?;
                let nonce = take_u64(&mut buf)?;
                let user_agent = read_var_str(&mut buf, MAX_USER_AGENT_LEN)?;
                let start_height = take_u32(&mut buf)?;
                let relay = if buf.has_remaining() { buf.get_u8() != 0 } else { true };
                Message::Version(VersionPayload {
                    protocol_version,
                    services,
                    timestamp,
                    receiver,
                    sender,
                    nonce,
                    user_agent,
                    start_height,
                    relay,
                })
            }
            "verack" => Message::Verack,
            "mempool" => Message::MemPool,
            "filterclear" => Message::FilterClear,
            "getaddr" => Message::GetAddr,
            "ping" => Message::Ping { nonce: take_u64(&mut buf)? },
            "pong" => Message::Pong { nonce: take_u64(&mut buf)? },
            "addr" => {
                let count = read_varint(&mut buf)? as usize;
                bound(count, MAX_ADDR_ENTRIES, "addr")?;
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    addrs.push(NetworkAddress::decode(&mut buf, true)?);
                }
                Message::Addr(addrs)
            }
            "inv" | "getdata" | "notfound" => {
                let items = decode_inventory(&mut buf)?;
                match command {
                    "inv" => Message::Inv(items),
                    "getdata" => Message::GetData(items),
                    _ => Message::NotFound(items),
                }
            }
            "getheaders" | "getblocks" => {
                let _version = take_u32(&mut buf)?;
                let count = read_varint(&mut buf)? as usize;
                bound(count, MAX_HEADERS, command)?;
                let mut block_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    block_ids.push(take_hash(&mut buf)?);
                }
                let hash_stop = take_hash(&mut buf)?;
                let locator = BlockLocator { block_ids };
                if command == "getheaders" {
                    Message::GetHeaders { locator, hash_stop }
                } else {
                    Message::GetBlocks { locator, hash_stop }
                }
            }
            "headers" => {
                let count = read_varint(&mut buf)? as usize;
                bound(count, MAX_HEADERS, "headers")?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    require(&buf, 80)?;
                    let header = BlockHeader::decode(&buf[..80])
                        .ok_or_else(|| CodecError::MalformedPayload("bad header".into()))?;
                    buf.advance(80);
                    let _tx_count = read_varint(&mut buf)?;
                    headers.push(header);
                }
                Message::Headers(headers)
            }
            "block" => Message::Block(payload.to_vec()),
            "tx" => {
                bound(payload.len(), MAX_RAW_TX_LEN, "tx")?;
                Message::Tx(payload.to_vec())
            }
            "merkleblock" => {
                require(&buf, 80)?;
                let header = BlockHeader::decode(&buf[..80])
                    .ok_or_else(|| CodecError::MalformedPayload("bad header".into()))?;
                buf.advance(80);
                let tx_count = take_u32(&mut buf)?;
                let hash_count = read_varint(&mut buf)? as usize;
                bound(hash_count, MAX_MERKLE_HASHES, "merkleblock hashes")?;
                let mut hashes = Vec::with_capacity(hash_count);
                for _ in 0..hash_count {
                    hashes.push(take_hash(&mut buf)?);
                }
                let flags = read_var_bytes(&mut buf, MAX_MERKLE_FLAG_BYTES)?;
                Message::MerkleBlock {
                    header,
                    tree: crate::merkle::PartialMerkleTree {
                        tx_count,
                        hashes,
                        flags,
                    },
                }
            }
            "filterload" => {
                let filter = read_var_bytes(&mut buf, MAX_FILTER_LEN)?;
                let num_hash_funcs = take_u32(&mut buf)?;
                let tweak = take_u32(&mut buf)?;
                let flags = if buf.has_remaining() { buf.get_u8() } else { 0 };
                Message::FilterLoad(FilterLoadPayload {
                    filter,
                    num_hash_funcs,
                    tweak,
                    flags,
                })
            }
            "filteradd" => Message::FilterAdd(read_var_bytes(&mut buf, MAX_SCRIPT_LEN)?),
            "reject" => {
                let rejected_command = read_var_str(&mut buf, MAX_USER_AGENT_LEN)?;
                require(&buf, 1)?;
                let code = RejectCode::from_wire(buf.get_u8());
                let reason = read_var_str(&mut buf, 256)?;
                let extra_data = if buf.remaining() >= 32 {
                    Some(take_hash(&mut buf)?)
                } else {
                    None
                };
                Message::Reject(RejectPayload {
                    rejected_command,
                    code,
                    reason,
                    extra_data,
                })
            }
            other => return Err(CodecError::UnknownCommand(other.to_string())),
        };
        Ok(msg)
    }
}

fn decode_inventory(buf: &mut &[u8]) -> Result<Vec<InventoryItem>, CodecError> {
    let count = read_varint(buf)? as usize;
    bound(count, MAX_INVENTORY_ITEMS, "inventory")?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let kind_code = take_u32(buf)?;
        let kind = InventoryKind::from_wire_code(kind_code)
            .ok_or_else(|| CodecError::MalformedPayload(format!("unknown inventory kind {}", kind_code)))?;
        let hash = take_hash(buf)?;
        items.push(InventoryItem::new(kind, hash));
    }
    Ok(items)
}

fn bound(count: usize, max: usize, what: &str) -> Result<(), CodecError> {
    if count > max {
        Err(CodecError::MalformedPayload(format!(
            "{} count {} exceeds cap {}",
            what, count, max
        )))
    } else {
        Ok(())
    }
}

fn require(buf: &&[u8], n: usize) -> Result<(), CodecError> {
    if buf.len() < n {
        Err(CodecError::MalformedPayload(format!(
            "expected {} more bytes, got {}",
            n,
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    require(&buf, 4)?;
    Ok(buf.get_u32_le())
}

fn take_u64(buf: &mut &[u8]) -> Result<u64, CodecError> {
    require(&buf, 8)?;
    Ok(buf.get_u64_le())
}

fn take_i64(buf: &mut &[u8]) -> Result<i64, CodecError> {
    require(&buf, 8)?;
    Ok(buf.get_i64_le())
}

fn take_hash(buf: &mut &[u8]) -> Result<Hash256, CodecError> {
    require(&buf, 32)?;
    let mut bytes = [0u8; 32];
    buf.copy_to_slice(&mut bytes);
    Ok(Hash256(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr() -> NetworkAddress {
        NetworkAddress::new(
            SERVICE_NODE_NETWORK,
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            8333,
            None,
        )
    }

    fn round_trip(msg: Message) {
        let payload = msg.encode_payload();
        let decoded = Message::decode_payload(msg.command(), &payload).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn ping_pong_round_trip() {
        round_trip(Message::Ping { nonce: 42 });
        round_trip(Message::Pong { nonce: 42 });
    }

    #[test]
    fn empty_messages_round_trip() {
        round_trip(Message::Verack);
        round_trip(Message::MemPool);
        round_trip(Message::FilterClear);
        round_trip(Message::GetAddr);
    }

    #[test]
    fn version_round_trips() {
        let msg = Message::Version(VersionPayload {
            protocol_version: 70015,
            services: SERVICE_NODE_NETWORK,
            timestamp: 1_600_000_000,
            receiver: addr(),
            sender: addr(),
            nonce: 0xdead_beef,
            user_agent: "/spv:0.1.0/".into(),
            start_height: 100,
            relay: true,
        });
        round_trip(msg);
    }

    #[test]
    fn inv_getdata_notfound_round_trip() {
        let items = vec![
            InventoryItem::tx(Hash256::double_sha256(b"a")),
            InventoryItem::block(Hash256::double_sha256(b"b")),
            InventoryItem::filtered_block(Hash256::double_sha256(b"c")),
        ];
        round_trip(Message::Inv(items.clone()));
        round_trip(Message::GetData(items.clone()));
        round_trip(Message::NotFound(items));
    }

    #[test]
    fn getheaders_round_trips() {
        let locator = BlockLocator {
            block_ids: vec![Hash256::double_sha256(b"tip"), Hash256::ZERO],
        };
        round_trip(Message::GetHeaders {
            locator: locator.clone(),
            hash_stop: Hash256::ZERO,
        });
        round_trip(Message::GetBlocks {
            locator,
            hash_stop: Hash256::ZERO,
        });
    }

    #[test]
    fn headers_round_trips() {
        let header = BlockHeader::new(1, Hash256::ZERO, Hash256::ZERO, 0, 0x1d00ffff, 0);
        round_trip(Message::Headers(vec![header, header]));
    }

    #[test]
    fn merkleblock_round_trips() {
        let header = BlockHeader::new(1, Hash256::ZERO, Hash256::ZERO, 0, 0x1d00ffff, 0);
        let tree = crate::merkle::PartialMerkleTree::build(
            &[Hash256::double_sha256(b"0"), Hash256::double_sha256(b"1")],
            &[true, false],
        );
        round_trip(Message::MerkleBlock { header, tree });
    }

    #[test]
    fn filterload_round_trips() {
        round_trip(Message::FilterLoad(FilterLoadPayload {
            filter: vec![0xaa; 16],
            num_hash_funcs: 11,
            tweak: 5,
            flags: 1,
        }));
        round_trip(Message::FilterAdd(vec![1, 2, 3]));
    }

    #[test]
    fn reject_round_trips() {
        round_trip(Message::Reject(RejectPayload {
            rejected_command: "tx".into(),
            code: RejectCode::Duplicate,
            reason: "already in mempool".into(),
            extra_data: Some(Hash256::double_sha256(b"dup")),
        }));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = Message::decode_payload("notacommand", &[]).unwrap_err();
        assert!(matches!(err, CodecError::UnknownCommand(_)));
    }

    #[test]
    fn oversize_inventory_count_is_rejected() {
        let mut buf = BytesMut::new();
        write_varint(&mut buf, (MAX_INVENTORY_ITEMS + 1) as u64);
        let err = Message::decode_payload("inv", &buf).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload(_)));
    }
}
