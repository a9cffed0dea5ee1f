use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;

/// Identifies one sender incarnation's redundant stream ("SNSID"). All copies of a datagram,
///  whichever path they travel, carry the same [FlowIdentity].
///
/// Layout (20 bytes): the sender's IPv4 address repeated four times, the sender's UDP source
///  port (BE), and a reboot counter (BE). Bumping the reboot counter yields a different identity
///  for the same address and port, which receivers treat as an unrelated new flow.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FlowIdentity(pub [u8; FlowIdentity::SIZE]);

impl Debug for FlowIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}#{}]", self.sender_addr(), self.sender_port(), self.reboot_counter())
    }
}

impl FlowIdentity {
    pub const SIZE: usize = 20;

    pub fn new(sender_addr: Ipv4Addr, sender_port: u16, reboot_counter: u16) -> FlowIdentity {
        let mut raw = [0u8; Self::SIZE];
        for i in 0..4 {
            raw[4*i..4*i + 4].copy_from_slice(&sender_addr.octets());
        }
        raw[16..18].copy_from_slice(&sender_port.to_be_bytes());
        raw[18..20].copy_from_slice(&reboot_counter.to_be_bytes());
        FlowIdentity(raw)
    }

    pub fn sender_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[0], self.0[1], self.0[2], self.0[3])
    }

    pub fn sender_port(&self) -> u16 {
        u16::from_be_bytes([self.0[16], self.0[17]])
    }

    pub fn reboot_counter(&self) -> u16 {
        u16::from_be_bytes([self.0[18], self.0[19]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let id = FlowIdentity::new(Ipv4Addr::new(192, 168, 1, 7), 0x1234, 0xabcd);
        assert_eq!(&id.0, b"\xc0\xa8\x01\x07\xc0\xa8\x01\x07\xc0\xa8\x01\x07\xc0\xa8\x01\x07\x12\x34\xab\xcd");
        assert_eq!(id.sender_addr(), Ipv4Addr::new(192, 168, 1, 7));
        assert_eq!(id.sender_port(), 0x1234);
        assert_eq!(id.reboot_counter(), 0xabcd);
        assert_eq!(format!("{:?}", id), "[192.168.1.7:4660#43981]");
    }

    #[test]
    fn test_reboot_counter_distinguishes() {
        let a = FlowIdentity::new(Ipv4Addr::new(10, 0, 0, 1), 5000, 1);
        let b = FlowIdentity::new(Ipv4Addr::new(10, 0, 0, 1), 5000, 2);
        assert_ne!(a, b);
        assert_eq!(a.sender_addr(), b.sender_addr());
        assert_eq!(a.sender_port(), b.sender_port());
    }
}
