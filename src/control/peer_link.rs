use std::net::Ipv4Addr;

use anyhow::bail;
use bytes::{Buf, BufMut};

use crate::flow_id::FlowIdentity;
use crate::host::{HostDescriptor, Ind, Interface, PathBitmap, MAX_INDS};
use crate::registry::snapshot::{Keyed, SnapshotRecord};

/// Identifies a redundant flow on the sending side: destination (unicast receiver or multicast
///  group) plus ports of the original datagrams.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct LinkKey {
    pub dest_addr: Ipv4Addr,
    pub src_port: u16,
    pub dest_port: u16,
}

/// One physical path of a link: copies for it leave through the local interface and go to the
///  remote host's address on the same network
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Path {
    pub ind: Ind,
    pub local_addr: Ipv4Addr,
    pub remote_addr: Ipv4Addr,
}

impl Path {
    /// One path for each IND in `inds` for which both hosts have an interface
    pub fn for_inds(inds: PathBitmap, local: &HostDescriptor, remote: &HostDescriptor) -> Vec<Path> {
        inds.inds()
            .filter_map(|ind| {
                let local = local.get(ind)?;
                let remote = remote.get(ind)?;
                Some(Path {
                    ind,
                    local_addr: local.addr,
                    remote_addr: remote.addr,
                })
            })
            .collect()
    }
}

/// Sender-side state of a single redundant flow
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerLink {
    pub key: LinkKey,
    /// the local address the flow's original datagrams are sent from
    pub sender_addr: Ipv4Addr,
    pub flow_id: FlowIdentity,
    pub inds: PathBitmap,
    pub paths: Vec<Path>,
}

impl PeerLink {
    /// Adds matched INDs that were not part of the link before, together with their paths.
    ///  Returns the newly added INDs.
    pub fn merge_inds(&mut self, inds: PathBitmap, local: &HostDescriptor, remote: &HostDescriptor) -> PathBitmap {
        let added = inds.without(self.inds);
        if !added.is_empty() {
            self.inds = self.inds.union(added);
            self.paths.extend(Path::for_inds(added, local, remote));
            self.paths.sort_by_key(|p| p.ind);
        }
        added
    }
}

impl Keyed for PeerLink {
    type Key = LinkKey;

    fn key(&self) -> LinkKey {
        self.key
    }
}

impl SnapshotRecord for PeerLink {
    const SERIALIZED_LEN: usize = 4 + 2 + 2 + 4 + FlowIdentity::SIZE + 2 + 1 + MAX_INDS * (1 + 4 + 4);

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.key.dest_addr.to_bits());
        buf.put_u16(self.key.src_port);
        buf.put_u16(self.key.dest_port);
        buf.put_u32(self.sender_addr.to_bits());
        buf.put_slice(&self.flow_id.0);
        buf.put_u16(self.inds.0);

        // at most one path per IND
        let num_paths = self.paths.len().min(MAX_INDS);
        buf.put_u8(num_paths as u8);
        for path in &self.paths[..num_paths] {
            buf.put_u8(path.ind);
            buf.put_u32(path.local_addr.to_bits());
            buf.put_u32(path.remote_addr.to_bits());
        }
        buf.put_bytes(0, (MAX_INDS - num_paths) * 9);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<PeerLink> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer underflow reading a peer link");
        }

        let key = LinkKey {
            dest_addr: Ipv4Addr::from_bits(buf.get_u32()),
            src_port: buf.get_u16(),
            dest_port: buf.get_u16(),
        };
        let sender_addr = Ipv4Addr::from_bits(buf.get_u32());
        let mut flow_id = [0u8; FlowIdentity::SIZE];
        buf.copy_to_slice(&mut flow_id);
        let inds = PathBitmap(buf.get_u16());

        let num_paths = buf.get_u8() as usize;
        if num_paths > MAX_INDS {
            bail!("peer link with {} paths", num_paths);
        }
        let mut paths = Vec::with_capacity(num_paths);
        for _ in 0..num_paths {
            paths.push(Path {
                ind: buf.get_u8(),
                local_addr: Ipv4Addr::from_bits(buf.get_u32()),
                remote_addr: Ipv4Addr::from_bits(buf.get_u32()),
            });
        }
        buf.advance((MAX_INDS - num_paths) * 9);

        Ok(PeerLink {
            key,
            sender_addr,
            flow_id: FlowIdentity(flow_id),
            inds,
            paths,
        })
    }
}

/// Receiver-side key for the interfaces a sender told us about in an Acknowledge
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SenderKey {
    pub group_addr: Ipv4Addr,
    pub sender_addr: Ipv4Addr,
}

/// The interfaces of a remote sender, each paired with the local address on the same network
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SenderInterfaces {
    pub key: SenderKey,
    pub interfaces: Vec<(Interface, Ipv4Addr)>,
}

impl SenderInterfaces {
    pub fn new(key: SenderKey, remote: &HostDescriptor, local: &HostDescriptor) -> SenderInterfaces {
        let interfaces = remote.interfaces().iter()
            .filter_map(|remote_if| local.get(remote_if.ind).map(|local_if| (*remote_if, local_if.addr)))
            .collect();
        SenderInterfaces {
            key,
            interfaces,
        }
    }
}

impl Keyed for SenderInterfaces {
    type Key = SenderKey;

    fn key(&self) -> SenderKey {
        self.key
    }
}

impl SnapshotRecord for SenderInterfaces {
    const SERIALIZED_LEN: usize = 4 + 4 + 1 + MAX_INDS * (1 + 4 + 4);

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.key.group_addr.to_bits());
        buf.put_u32(self.key.sender_addr.to_bits());

        let num_interfaces = self.interfaces.len().min(MAX_INDS);
        buf.put_u8(num_interfaces as u8);
        for (remote, local_addr) in &self.interfaces[..num_interfaces] {
            buf.put_u8(remote.ind);
            buf.put_u32(remote.addr.to_bits());
            buf.put_u32(local_addr.to_bits());
        }
        buf.put_bytes(0, (MAX_INDS - num_interfaces) * 9);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<SenderInterfaces> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer underflow reading sender interfaces");
        }

        let key = SenderKey {
            group_addr: Ipv4Addr::from_bits(buf.get_u32()),
            sender_addr: Ipv4Addr::from_bits(buf.get_u32()),
        };

        let num_interfaces = buf.get_u8() as usize;
        if num_interfaces > MAX_INDS {
            bail!("sender with {} interfaces", num_interfaces);
        }
        let mut interfaces = Vec::with_capacity(num_interfaces);
        for _ in 0..num_interfaces {
            let remote = Interface {
                ind: buf.get_u8(),
                addr: Ipv4Addr::from_bits(buf.get_u32()),
            };
            interfaces.push((remote, Ipv4Addr::from_bits(buf.get_u32())));
        }
        buf.advance((MAX_INDS - num_interfaces) * 9);

        Ok(SenderInterfaces {
            key,
            interfaces,
        })
    }
}
