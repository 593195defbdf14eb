//! Byte encoding of everything exchanged between ranks.
//!
//! Integers and floats are little-endian, `usize` travels as a `u64` and
//! vectors carry a `u64` length prefix. There is no schema: both ends run
//! the same binary.

use glam::DVec3;

use crate::{
    cell::{CellTimeInfo, PCell},
    part::{GPart, Part, ParticleKind, PartnerLink, SPart},
};

pub trait Wire: Sized {
    fn encode(&self, buf: &mut Vec<u8>);

    fn decode(reader: &mut Reader) -> Option<Self>;
}

/// Cursor over a received message.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let chunk = self.bytes.get(self.pos..self.pos + N)?;
        self.pos += N;
        chunk.try_into().ok()
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

pub fn encode<T: Wire>(value: &T) -> Vec<u8> {
    let mut buf = vec![];
    value.encode(&mut buf);
    buf
}

/// Decode a whole message. Trailing bytes make it invalid.
pub fn decode<T: Wire>(bytes: &[u8]) -> Option<T> {
    let mut reader = Reader::new(bytes);
    let value = T::decode(&mut reader)?;
    (reader.remaining() == 0).then_some(value)
}

macro_rules! wire_number {
    ($($ty:ty),*) => {
        $(
            impl Wire for $ty {
                fn encode(&self, buf: &mut Vec<u8>) {
                    buf.extend_from_slice(&self.to_le_bytes());
                }

                fn decode(reader: &mut Reader) -> Option<Self> {
                    reader.take().map(<$ty>::from_le_bytes)
                }
            }
        )*
    };
}

wire_number!(u8, i8, u32, u64, f64);

impl Wire for usize {
    fn encode(&self, buf: &mut Vec<u8>) {
        (*self as u64).encode(buf);
    }

    fn decode(reader: &mut Reader) -> Option<Self> {
        usize::try_from(u64::decode(reader)?).ok()
    }
}

impl Wire for bool {
    fn encode(&self, buf: &mut Vec<u8>) {
        u8::from(*self).encode(buf);
    }

    fn decode(reader: &mut Reader) -> Option<Self> {
        match u8::decode(reader)? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }
}

impl Wire for DVec3 {
    fn encode(&self, buf: &mut Vec<u8>) {
        for x in self.to_array() {
            x.encode(buf);
        }
    }

    fn decode(reader: &mut Reader) -> Option<Self> {
        Some(DVec3::new(f64::decode(reader)?, f64::decode(reader)?, f64::decode(reader)?))
    }
}

impl<T: Wire> Wire for Option<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            None => 0u8.encode(buf),
            Some(value) => {
                1u8.encode(buf);
                value.encode(buf);
            }
        }
    }

    fn decode(reader: &mut Reader) -> Option<Self> {
        match u8::decode(reader)? {
            0 => Some(None),
            1 => T::decode(reader).map(Some),
            _ => None,
        }
    }
}

impl<T: Wire, const N: usize> Wire for [T; N] {
    fn encode(&self, buf: &mut Vec<u8>) {
        for item in self.iter() {
            item.encode(buf);
        }
    }

    fn decode(reader: &mut Reader) -> Option<Self> {
        let items: Vec<T> = (0..N).map(|_| T::decode(reader)).collect::<Option<_>>()?;
        items.try_into().ok()
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.len().encode(buf);
        for item in self.iter() {
            item.encode(buf);
        }
    }

    fn decode(reader: &mut Reader) -> Option<Self> {
        let len = usize::decode(reader)?;
        // Every item takes at least one byte.
        if len > reader.remaining() {
            return None;
        }
        (0..len).map(|_| T::decode(reader)).collect()
    }
}

impl Wire for ParticleKind {
    fn encode(&self, buf: &mut Vec<u8>) {
        let kind: u8 = match self {
            ParticleKind::DarkMatter => 0,
            ParticleKind::Gas => 1,
            ParticleKind::Star => 2,
        };
        kind.encode(buf);
    }

    fn decode(reader: &mut Reader) -> Option<Self> {
        match u8::decode(reader)? {
            0 => Some(ParticleKind::DarkMatter),
            1 => Some(ParticleKind::Gas),
            2 => Some(ParticleKind::Star),
            _ => None,
        }
    }
}

impl Wire for PartnerLink {
    fn encode(&self, buf: &mut Vec<u8>) {
        match *self {
            PartnerLink::None => 0u8.encode(buf),
            PartnerLink::Local(i) => {
                1u8.encode(buf);
                i.encode(buf);
            }
            PartnerLink::Pending(i) => {
                2u8.encode(buf);
                i.encode(buf);
            }
        }
    }

    fn decode(reader: &mut Reader) -> Option<Self> {
        match u8::decode(reader)? {
            0 => Some(PartnerLink::None),
            1 => usize::decode(reader).map(PartnerLink::Local),
            2 => usize::decode(reader).map(PartnerLink::Pending),
            _ => None,
        }
    }
}

/// Field-by-field encoding of a plain struct, in declaration order.
macro_rules! wire_struct {
    ($ty:ident { $($field:ident),* $(,)? }) => {
        impl Wire for $ty {
            fn encode(&self, buf: &mut Vec<u8>) {
                $(self.$field.encode(buf);)*
            }

            fn decode(reader: &mut Reader) -> Option<Self> {
                Some($ty {
                    $($field: Wire::decode(reader)?,)*
                })
            }
        }
    };
}

wire_struct!(Part { id, x, v, a_hydro, mass, h, rho, u, u_dt, time_bin, x_diff, gpart });
wire_struct!(GPart { id, x, v, a_grav, mass, time_bin, x_diff, kind, partner });
wire_struct!(SPart { id, x, v, mass, time_bin, x_diff, gpart });
wire_struct!(PCell { h_max, dx_max, ti_end_min, ti_end_max, count, gcount, scount, tag, progeny });
wire_struct!(CellTimeInfo { ti_end_min, ti_end_max, h_max });

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_particles_survive_the_wire() {
        let part = Part {
            id: 42,
            x: DVec3::new(0.1, 0.2, 0.3),
            h: 0.05,
            time_bin: 7,
            gpart: Some(3),
            ..Default::default()
        };
        let gpart = GPart {
            id: 42,
            kind: ParticleKind::Gas,
            partner: PartnerLink::Pending(11),
            ..Default::default()
        };
        let parts: Vec<Part> = decode(&encode(&vec![part.clone(), Part::default()])).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!((parts[0].id, parts[0].x, parts[0].h), (42, part.x, 0.05));
        assert_eq!((parts[0].time_bin, parts[0].gpart), (7, Some(3)));
        assert_eq!(parts[1].gpart, None);

        let gparts: Vec<GPart> = decode(&encode(&vec![gpart])).unwrap();
        assert_eq!(gparts[0].kind, ParticleKind::Gas);
        assert_eq!(gparts[0].partner, PartnerLink::Pending(11));
    }

    #[test]
    fn test_nested_cells() {
        let leaf = PCell { count: 3, tag: 9, ..Default::default() };
        let mut root = PCell { count: 3, tag: 8, ..Default::default() };
        root.progeny[5] = Some(1);
        let trees = vec![vec![root, leaf], vec![]];
        let decoded: Vec<Vec<PCell>> = decode(&encode(&trees)).unwrap();
        assert_eq!(decoded, trees);
    }

    #[test]
    fn test_malformed_messages_are_rejected() {
        let bytes = encode(&vec![1u64, 2, 3]);
        assert!(decode::<Vec<u64>>(&bytes[..bytes.len() - 1]).is_none());
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(decode::<Vec<u64>>(&longer).is_none());
        // A length prefix larger than the message.
        assert!(decode::<Vec<u8>>(&encode(&u64::MAX)).is_none());
        assert!(decode::<bool>(&[2]).is_none());
    }
}
