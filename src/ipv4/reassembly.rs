//! Reassembly of fragmented IPv4 datagrams.
//!
//! Fragments are grouped by (source, destination, protocol, identification).
//! Each group keeps the received payload ranges, the header of the
//! zero-offset fragment, and a hard deadline. Out-of-order and duplicate
//! arrival are tolerated; overlapping ranges are last-write-wins. The IPv4
//! module thread owns the set exclusively and drives the reaper from its
//! tick.

use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::{MORE_FRAGMENTS, NO_FLAGS};

/// Identifies the datagram a fragment belongs to.
pub type FragmentKey = (Ipv4Addr, Ipv4Addr, u8, u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyError {
    /// A fragment offset/length combination that cannot belong to a valid
    /// datagram, or two final fragments that disagree.
    Inconsistent,
    /// The reassembled datagram would exceed the 16-bit total length.
    TooLarge,
}

#[derive(Debug)]
struct Gap {
    offset: usize,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Partial {
    /// Header bytes of the zero-offset fragment, options included.
    header: Option<Vec<u8>>,
    fragments: Vec<Gap>,
    /// Payload length, known once the fragment without MF arrives.
    total_len: Option<usize>,
    deadline: Instant,
}

impl Partial {
    fn new(deadline: Instant) -> Partial {
        Partial {
            header: None,
            fragments: Vec::new(),
            total_len: None,
            deadline: deadline,
        }
    }

    /// True when the received ranges cover `[0, total_len)` without holes.
    fn complete(&self) -> bool {
        let total = match self.total_len {
            Some(total) => total,
            None => return false,
        };
        if self.header.is_none() {
            return false;
        }
        let mut ranges: Vec<(usize, usize)> = self.fragments
            .iter()
            .map(|f| (f.offset, f.offset + f.data.len()))
            .collect();
        ranges.sort();
        let mut covered = 0;
        for (start, end) in ranges {
            if start > covered {
                return false;
            }
            if end > covered {
                covered = end;
            }
        }
        covered >= total
    }

    /// Builds the full datagram: retained header, flags cleared, total
    /// length and checksum rewritten.
    fn assemble(self) -> Vec<u8> {
        let header = self.header.expect("assemble called before completion");
        let total = self.total_len.expect("assemble called before completion");
        let mut packet = vec![0u8; header.len() + total];
        packet[..header.len()].copy_from_slice(&header);
        for fragment in &self.fragments {
            let start = header.len() + fragment.offset;
            packet[start..start + fragment.data.len()].copy_from_slice(&fragment.data);
        }
        let total_length = packet.len() as u16;
        {
            let mut ip_pkg = MutableIpv4Packet::new(&mut packet).unwrap();
            ip_pkg.set_flags(NO_FLAGS);
            ip_pkg.set_fragment_offset(0);
            ip_pkg.set_total_length(total_length);
            let csum = ipv4::checksum(&ip_pkg.to_immutable());
            ip_pkg.set_checksum(csum);
        }
        packet
    }
}

/// The set of datagrams currently being reassembled.
pub struct ReassemblySet {
    partials: HashMap<FragmentKey, Partial>,
    timeout: Duration,
}

impl ReassemblySet {
    pub fn new(timeout: Duration) -> ReassemblySet {
        ReassemblySet {
            partials: HashMap::new(),
            timeout: timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    /// Inserts one validated fragment. `ip_pkg` must be a fragment (MF set
    /// or nonzero offset). Returns the reassembled datagram once coverage
    /// completes.
    pub fn insert(&mut self,
                  ip_pkg: &Ipv4Packet,
                  now: Instant)
                  -> Result<Option<Vec<u8>>, ReassemblyError> {
        use pnet::packet::Packet;

        let key = Self::key_of(ip_pkg);
        let offset = ip_pkg.get_fragment_offset() as usize * 8;
        let payload = ip_pkg.payload();
        let last = (ip_pkg.get_flags() & MORE_FRAGMENTS) == 0;
        if offset + payload.len() > ::std::u16::MAX as usize {
            return Err(ReassemblyError::TooLarge);
        }
        // Fragments other than the last must carry 8-octet multiples.
        if !last && payload.len() % 8 != 0 {
            return Err(ReassemblyError::Inconsistent);
        }

        let deadline = now + self.timeout;
        let done = {
            let partial = self.partials.entry(key).or_insert_with(|| Partial::new(deadline));
            if offset == 0 {
                let header_len = ip_pkg.get_header_length() as usize * 4;
                partial.header = Some(ip_pkg.packet()[..header_len].to_vec());
            }
            if last {
                let end = offset + payload.len();
                match partial.total_len {
                    Some(existing) if existing != end => {
                        return Err(ReassemblyError::Inconsistent)
                    }
                    _ => partial.total_len = Some(end),
                }
            }
            partial.fragments.push(Gap {
                offset: offset,
                data: payload.to_vec(),
            });
            partial.complete()
        };
        if done {
            let partial = self.partials.remove(&key).unwrap();
            Ok(Some(partial.assemble()))
        } else {
            Ok(None)
        }
    }

    /// Drops groups past their deadline. For each expired group the key and
    /// the retained first-fragment header (when it was seen) are returned,
    /// so the caller can raise a reassembly-time-exceeded error toward the
    /// source.
    pub fn reap(&mut self, now: Instant) -> Vec<(FragmentKey, Option<Vec<u8>>)> {
        let expired: Vec<FragmentKey> = self.partials
            .iter()
            .filter(|&(_, partial)| partial.deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        expired.into_iter()
            .map(|key| {
                let partial = self.partials.remove(&key).unwrap();
                (key, partial.header)
            })
            .collect()
    }

    fn key_of(ip_pkg: &Ipv4Packet) -> FragmentKey {
        (ip_pkg.get_source(),
         ip_pkg.get_destination(),
         ip_pkg.get_next_level_protocol().0,
         ip_pkg.get_identification())
    }
}
