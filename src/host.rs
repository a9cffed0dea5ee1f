use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;

use anyhow::bail;
use bytes::{Buf, BufMut};

/// Interface id ("IND"): a small number naming one physical network of a redundant setup. Hosts
///  attached to the same physical network use the same IND for their interface on it, so the
///  IND doubles as a bit index in [PathBitmap].
pub type Ind = u8;

/// Upper bound for IND values, determined by the width of [PathBitmap]
pub const MAX_INDS: usize = 16;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct PathBitmap(pub u16);

impl Debug for PathBitmap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06b}", self.0)
    }
}

impl PathBitmap {
    pub const EMPTY: PathBitmap = PathBitmap(0);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, ind: Ind) -> bool {
        (ind as usize) < MAX_INDS && self.0 & (1 << ind) != 0
    }

    pub fn with(self, ind: Ind) -> PathBitmap {
        if (ind as usize) < MAX_INDS {
            PathBitmap(self.0 | (1 << ind))
        }
        else {
            self
        }
    }

    pub fn intersect(self, other: PathBitmap) -> PathBitmap {
        PathBitmap(self.0 & other.0)
    }

    pub fn union(self, other: PathBitmap) -> PathBitmap {
        PathBitmap(self.0 | other.0)
    }

    /// the bits that are set in `self` but not in `other`
    pub fn without(self, other: PathBitmap) -> PathBitmap {
        PathBitmap(self.0 & !other.0)
    }

    /// set INDs in ascending order
    pub fn inds(self) -> impl Iterator<Item=Ind> {
        (0..MAX_INDS as u8).filter(move |&ind| self.contains(ind))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Interface {
    pub ind: Ind,
    pub addr: Ipv4Addr,
}

/// The interfaces a host exposes for redundant delivery, at most one per IND.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct HostDescriptor {
    interfaces: Vec<Interface>,
}

impl HostDescriptor {
    /// serialized size, padded to the maximum number of interfaces
    pub const SERIALIZED_LEN: usize = 1 + MAX_INDS * 5;

    pub fn new(interfaces: impl IntoIterator<Item=(Ind, Ipv4Addr)>) -> anyhow::Result<HostDescriptor> {
        let mut result = HostDescriptor::default();
        for (ind, addr) in interfaces {
            if ind as usize >= MAX_INDS {
                bail!("interface id {} exceeds the maximum of {}", ind, MAX_INDS - 1);
            }
            if result.get(ind).is_some() {
                bail!("duplicate interface id {}", ind);
            }
            result.interfaces.push(Interface { ind, addr });
        }
        Ok(result)
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    pub fn get(&self, ind: Ind) -> Option<&Interface> {
        self.interfaces.iter()
            .find(|i| i.ind == ind)
    }

    pub fn bitmap(&self) -> PathBitmap {
        self.interfaces.iter()
            .fold(PathBitmap::EMPTY, |acc, i| acc.with(i.ind))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.interfaces.len() as u8);
        for i in 0..MAX_INDS {
            match self.interfaces.get(i) {
                Some(iface) => {
                    buf.put_u8(iface.ind);
                    buf.put_u32(iface.addr.to_bits());
                }
                None => {
                    buf.put_u8(0);
                    buf.put_u32(0);
                }
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<HostDescriptor> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer underflow reading host descriptor");
        }

        let count = buf.get_u8() as usize;
        if count > MAX_INDS {
            bail!("host descriptor with {} interfaces", count);
        }

        let mut raw = Vec::with_capacity(count);
        for i in 0..MAX_INDS {
            let ind = buf.get_u8();
            let addr = Ipv4Addr::from_bits(buf.get_u32());
            if i < count {
                raw.push((ind, addr));
            }
        }
        HostDescriptor::new(raw)
    }
}

/// Computes the INDs that `local` shares with a peer advertising `remote_inds`. Both peers
///  compute the same intersection independently, each from its own interfaces.
///
/// An empty result means that no redundant path is possible.
pub fn ind_match(local: &HostDescriptor, remote_inds: PathBitmap) -> PathBitmap {
    local.bitmap().intersect(remote_inds)
}
