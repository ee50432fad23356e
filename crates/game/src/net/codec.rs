use bytes::{Buf, BufMut, Bytes, BytesMut};
use glam::Vec3;
use thiserror::Error;

use super::protocol::{MAX_STRING_LEN, Packet, PacketKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty packet")]
    Empty,
    #[error("unknown packet discriminant {0}")]
    UnknownDiscriminant(u8),
    #[error("{kind:?} payload truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        kind: PacketKind,
        needed: usize,
        remaining: usize,
    },
    #[error("malformed string length prefix in {0:?}")]
    BadStringLength(PacketKind),
    #[error("string of {0} bytes exceeds the length limit")]
    StringTooLong(usize),
    #[error("string in {0:?} is not valid utf-8")]
    InvalidUtf8(PacketKind),
    #[error("{count} trailing bytes after {kind:?} payload")]
    TrailingBytes { kind: PacketKind, count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("{kind:?} string of {len} bytes exceeds the length limit")]
    StringTooLong { kind: PacketKind, len: usize },
}

/// Rejects strings the decoder would refuse, so every encoded frame
/// decodes back to the same packet.
pub fn check_string(kind: PacketKind, value: &str) -> Result<(), EncodeError> {
    if value.len() > MAX_STRING_LEN {
        return Err(EncodeError::StringTooLong {
            kind,
            len: value.len(),
        });
    }
    Ok(())
}

pub fn encode(packet: &Packet) -> Result<Bytes, EncodeError> {
    match packet {
        Packet::GameStart { map_path } => check_string(PacketKind::GameStart, map_path)?,
        Packet::AbilityCast { ability_name, .. } => {
            check_string(PacketKind::AbilityCast, ability_name)?
        }
        _ => {}
    }

    let mut buf = BytesMut::with_capacity(encoded_len(packet));
    buf.put_u8(packet.kind() as u8);

    match packet {
        Packet::Handshake { identity } | Packet::PeerLeft { identity } => {
            buf.put_u8(*identity);
        }
        Packet::SessionSync {
            identity,
            platform_id,
            loadout_index,
            is_ready,
        } => {
            buf.put_u8(*identity);
            buf.put_u64_le(*platform_id);
            buf.put_i32_le(*loadout_index);
            buf.put_u8(*is_ready as u8);
        }
        Packet::GameStart { map_path } => {
            put_string(&mut buf, map_path);
        }
        Packet::PositionUpdate {
            identity,
            position,
            rotation,
        } => {
            buf.put_u8(*identity);
            put_vec3(&mut buf, *position);
            put_vec3(&mut buf, *rotation);
        }
        Packet::ClassSelected {
            identity,
            loadout_index,
        } => {
            buf.put_u8(*identity);
            buf.put_i32_le(*loadout_index);
        }
        Packet::AbilityCast {
            identity,
            ability_name,
        } => {
            buf.put_u8(*identity);
            put_string(&mut buf, ability_name);
        }
        Packet::MoveCommand { identity, target } => {
            buf.put_u8(*identity);
            put_vec3(&mut buf, *target);
        }
        Packet::ReadyStatus { identity, is_ready } => {
            buf.put_u8(*identity);
            buf.put_u8(*is_ready as u8);
        }
        Packet::DamageEvent {
            target,
            damage,
            new_health,
        } => {
            buf.put_u8(*target);
            buf.put_i16_le(*damage);
            buf.put_i16_le(*new_health);
        }
        Packet::DeathEvent { victim, killer } => {
            buf.put_u8(*victim);
            buf.put_u8(*killer);
        }
    }

    Ok(buf.freeze())
}

pub fn decode(data: &[u8]) -> Result<Packet, DecodeError> {
    let Some((&tag, payload)) = data.split_first() else {
        return Err(DecodeError::Empty);
    };
    let kind = PacketKind::from_u8(tag).ok_or(DecodeError::UnknownDiscriminant(tag))?;
    let mut reader = PayloadReader { kind, buf: payload };

    let packet = match kind {
        PacketKind::Handshake => Packet::Handshake {
            identity: reader.u8()?,
        },
        PacketKind::SessionSync => Packet::SessionSync {
            identity: reader.u8()?,
            platform_id: reader.u64()?,
            loadout_index: reader.i32()?,
            is_ready: reader.bool()?,
        },
        PacketKind::GameStart => Packet::GameStart {
            map_path: reader.string()?,
        },
        PacketKind::PositionUpdate => Packet::PositionUpdate {
            identity: reader.u8()?,
            position: reader.vec3()?,
            rotation: reader.vec3()?,
        },
        PacketKind::ClassSelected => Packet::ClassSelected {
            identity: reader.u8()?,
            loadout_index: reader.i32()?,
        },
        PacketKind::AbilityCast => Packet::AbilityCast {
            identity: reader.u8()?,
            ability_name: reader.string()?,
        },
        PacketKind::MoveCommand => Packet::MoveCommand {
            identity: reader.u8()?,
            target: reader.vec3()?,
        },
        PacketKind::ReadyStatus => Packet::ReadyStatus {
            identity: reader.u8()?,
            is_ready: reader.bool()?,
        },
        PacketKind::DamageEvent => Packet::DamageEvent {
            target: reader.u8()?,
            damage: reader.i16()?,
            new_health: reader.i16()?,
        },
        PacketKind::DeathEvent => Packet::DeathEvent {
            victim: reader.u8()?,
            killer: reader.u8()?,
        },
        PacketKind::PeerLeft => Packet::PeerLeft {
            identity: reader.u8()?,
        },
    };

    reader.finish()?;
    Ok(packet)
}

pub fn encoded_len(packet: &Packet) -> usize {
    1 + match packet {
        Packet::Handshake { .. } | Packet::PeerLeft { .. } => 1,
        Packet::SessionSync { .. } => 1 + 8 + 4 + 1,
        Packet::GameStart { map_path } => string_len(map_path),
        Packet::PositionUpdate { .. } => 1 + 12 + 12,
        Packet::ClassSelected { .. } => 1 + 4,
        Packet::AbilityCast { ability_name, .. } => 1 + string_len(ability_name),
        Packet::MoveCommand { .. } => 1 + 12,
        Packet::ReadyStatus { .. } => 1 + 1,
        Packet::DamageEvent { .. } => 1 + 2 + 2,
        Packet::DeathEvent { .. } => 2,
    }
}

fn string_len(value: &str) -> usize {
    let mut len = value.len();
    let mut prefix = 1;
    while len >= 0x80 {
        len >>= 7;
        prefix += 1;
    }
    prefix + value.len()
}

fn put_string(buf: &mut BytesMut, value: &str) {
    let mut len = value.len();
    while len >= 0x80 {
        buf.put_u8((len as u8 & 0x7f) | 0x80);
        len >>= 7;
    }
    buf.put_u8(len as u8);
    buf.put_slice(value.as_bytes());
}

fn put_vec3(buf: &mut BytesMut, value: Vec3) {
    buf.put_f32_le(value.x);
    buf.put_f32_le(value.y);
    buf.put_f32_le(value.z);
}

struct PayloadReader<'a> {
    kind: PacketKind,
    buf: &'a [u8],
}

impl PayloadReader<'_> {
    fn ensure(&self, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                kind: self.kind,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.u8()? != 0)
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        self.ensure(2)?;
        Ok(self.buf.get_i16_le())
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn f32(&mut self) -> Result<f32, DecodeError> {
        self.ensure(4)?;
        Ok(self.buf.get_f32_le())
    }

    fn vec3(&mut self) -> Result<Vec3, DecodeError> {
        Ok(Vec3::new(self.f32()?, self.f32()?, self.f32()?))
    }

    fn string_len(&mut self) -> Result<usize, DecodeError> {
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                return Ok(len);
            }
            shift += 7;
            if shift > 28 {
                return Err(DecodeError::BadStringLength(self.kind));
            }
        }
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.string_len()?;
        if len > MAX_STRING_LEN {
            return Err(DecodeError::StringTooLong(len));
        }
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        String::from_utf8(head.to_vec()).map_err(|_| DecodeError::InvalidUtf8(self.kind))
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.buf.has_remaining() {
            return Err(DecodeError::TrailingBytes {
                kind: self.kind,
                count: self.buf.remaining(),
            });
        }
        Ok(())
    }
}
