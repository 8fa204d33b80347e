//! Stripe placement.
//!
//! Logical file offsets are cut into stripes of `stripe_size` bytes. RAID 0 deals stripes
//! round-robin and stacks them in rows on each member. Parity levels group `data_members`
//! consecutive stripes; every member reserves two slots per group, the parity slot first and
//! the data slot second, so a member that holds parity for a group never overwrites its own data.

use serde::Deserialize;

use crate::fs::FsError;

/// Redundancy scheme of a RAID group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum Level {
    /// Striping without redundancy.
    Raid0,
    /// Full mirror on every member.
    Raid1,
    /// Striping with one rotating parity block per group.
    Raid5,
    /// Striping with two parity blocks per group.
    Raid6,
}

impl Level {
    /// Fewest members the level can run with.
    #[must_use]
    pub const fn min_members(self) -> usize {
        match self {
            Self::Raid0 | Self::Raid1 => 2,
            Self::Raid5 => 3,
            Self::Raid6 => 4,
        }
    }

    /// Parity blocks per stripe group.
    #[must_use]
    pub const fn parity_blocks(self) -> usize {
        match self {
            Self::Raid0 | Self::Raid1 => 0,
            Self::Raid5 => 1,
            Self::Raid6 => 2,
        }
    }

    /// Whether this level keeps parity.
    #[must_use]
    pub const fn has_parity(self) -> bool {
        self.parity_blocks() > 0
    }
}

impl TryFrom<u8> for Level {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Raid0),
            1 => Ok(Self::Raid1),
            5 => Ok(Self::Raid5),
            6 => Ok(Self::Raid6),
            other => Err(format!("unsupported RAID level {other}, expected 0, 1, 5 or 6")),
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = match self {
            Self::Raid0 => 0,
            Self::Raid1 => 1,
            Self::Raid5 => 5,
            Self::Raid6 => 6,
        };
        write!(f, "raid{n}")
    }
}

/// One stripe-aligned piece of a logical byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Logical stripe index.
    pub stripe: u64,
    /// Offset inside the stripe.
    pub within: u64,
    /// Bytes covered by this piece.
    pub len: u64,
    /// Offset of this piece inside the caller's buffer.
    pub buf_offset: u64,
}

/// Where a RAID group puts each logical byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    level: Level,
    members: usize,
    stripe_size: u64,
}

impl Geometry {
    /// Stripe size used when the configuration does not name one.
    pub const DEFAULT_STRIPE_SIZE: u64 = 64 * 1024;

    /// Validate the member count and stripe size for `level`.
    pub fn new(level: Level, members: usize, stripe_size: u64) -> Result<Self, FsError> {
        if members < level.min_members() || stripe_size == 0 {
            return Err(FsError::InvalidArgument);
        }
        Ok(Self {
            level,
            members,
            stripe_size,
        })
    }

    #[must_use]
    pub const fn level(&self) -> Level {
        self.level
    }

    #[must_use]
    pub const fn members(&self) -> usize {
        self.members
    }

    #[must_use]
    pub const fn stripe_size(&self) -> u64 {
        self.stripe_size
    }

    /// Members that hold data blocks. For RAID 1 every member holds everything.
    #[must_use]
    pub const fn data_members(&self) -> usize {
        match self.level {
            Level::Raid1 => 1,
            Level::Raid0 | Level::Raid5 | Level::Raid6 => {
                self.members - self.level.parity_blocks()
            }
        }
    }

    /// Members that must be reachable to serve reads and writes of a file.
    #[must_use]
    pub const fn open_quorum(&self) -> usize {
        match self.level {
            Level::Raid0 => self.members,
            Level::Raid1 => 1,
            Level::Raid5 | Level::Raid6 => self.data_members(),
        }
    }

    const fn width(&self) -> u64 {
        self.data_members() as u64
    }

    /// Parity group of logical stripe `stripe`.
    #[must_use]
    pub const fn group(&self, stripe: u64) -> u64 {
        stripe / self.width()
    }

    /// Member holding the data of logical stripe `stripe`.
    #[must_use]
    pub const fn data_member(&self, stripe: u64) -> usize {
        (stripe % self.width()) as usize
    }

    /// Member-local offset where logical stripe `stripe` begins.
    #[must_use]
    pub const fn data_offset(&self, stripe: u64) -> u64 {
        match self.level {
            Level::Raid1 => stripe * self.stripe_size,
            Level::Raid0 => (stripe / self.width()) * self.stripe_size,
            Level::Raid5 | Level::Raid6 => (2 * self.group(stripe) + 1) * self.stripe_size,
        }
    }

    /// Member-local offset of the parity slot of `group`.
    #[must_use]
    pub const fn parity_offset(&self, group: u64) -> u64 {
        2 * group * self.stripe_size
    }

    /// Members holding the parity blocks of `group`, first parity first.
    #[must_use]
    pub fn parity_members(&self, group: u64) -> Vec<usize> {
        let n = self.members as u64;
        let dp = self.width();
        match self.level {
            Level::Raid0 | Level::Raid1 => Vec::new(),
            Level::Raid5 => vec![((group * dp + dp) % n) as usize],
            Level::Raid6 => {
                let base = dp + group % 2;
                vec![(base % n) as usize, ((base + 1) % n) as usize]
            }
        }
    }

    /// Logical stripes of `group`.
    #[must_use]
    pub const fn group_stripes(&self, group: u64) -> std::ops::Range<u64> {
        let first = group * self.width();
        first..first + self.width()
    }

    /// Cut `[offset, offset + len)` into stripe-aligned pieces.
    #[must_use]
    pub fn chunks(&self, offset: u64, len: u64) -> Vec<Chunk> {
        let mut out = Vec::new();
        let mut pos = offset;
        let end = offset.saturating_add(len);
        while pos < end {
            let stripe = pos / self.stripe_size;
            let within = pos % self.stripe_size;
            let take = (self.stripe_size - within).min(end - pos);
            out.push(Chunk {
                stripe,
                within,
                len: take,
                buf_offset: pos - offset,
            });
            pos += take;
        }
        out
    }

    /// Logical file size implied by member file sizes. Unknown members count as empty.
    #[must_use]
    pub fn logical_size(&self, member_sizes: &[Option<u64>]) -> u64 {
        let s = self.stripe_size;
        let mut size = 0;
        for (member, len) in member_sizes.iter().enumerate() {
            let Some(len) = len.filter(|&l| l > 0) else {
                continue;
            };
            let last = len - 1;
            let end = match self.level {
                Level::Raid1 => len,
                Level::Raid0 => {
                    let stripe = (last / s) * self.width() + member as u64;
                    stripe * s + last % s + 1
                }
                Level::Raid5 | Level::Raid6 => {
                    let slot = last / s;
                    let group = slot / 2;
                    if slot % 2 == 1 {
                        if member >= self.data_members() {
                            continue;
                        }
                        let stripe = group * self.width() + member as u64;
                        stripe * s + last % s + 1
                    } else {
                        // A parity block is as long as the group's first data block.
                        group * self.width() * s + last % s + 1
                    }
                }
            };
            size = size.max(end);
        }
        size
    }

    /// Member file lengths that hold exactly a `size`-byte logical file.
    #[must_use]
    pub fn member_lengths(&self, size: u64) -> Vec<u64> {
        let mut lengths = vec![0; self.members];
        if self.level == Level::Raid1 {
            lengths.fill(size);
            return lengths;
        }
        if size == 0 {
            return lengths;
        }
        let s = self.stripe_size;
        let last = (size - 1) / s;
        let tail = (size - 1) % s + 1;
        let width = self.width();
        for member in 0..self.data_members() {
            let member_u = member as u64;
            // Highest stripe at or below `last` that lands on this member.
            let Some(stripe) = (last / width * width + member_u)
                .checked_sub(if member_u > last % width { width } else { 0 })
            else {
                continue;
            };
            let covered = if stripe == last { tail } else { s };
            lengths[member] = self.data_offset(stripe) + covered;
        }
        if self.level.has_parity() {
            let last_group = self.group(last);
            let last_parity = if last % width == 0 { tail } else { s };
            for group in 0..=last_group {
                let covered = if group == last_group { last_parity } else { s };
                for member in self.parity_members(group) {
                    let end = self.parity_offset(group) + covered;
                    lengths[member] = lengths[member].max(end);
                }
            }
        }
        lengths
    }
}

/// XOR `blocks` together into a buffer as long as the longest block.
#[must_use]
pub fn xor_blocks(blocks: &[&[u8]]) -> Vec<u8> {
    let len = blocks.iter().map(|b| b.len()).max().unwrap_or(0);
    let mut out = vec![0_u8; len];
    for block in blocks {
        for (dst, src) in out.iter_mut().zip(block.iter()) {
            *dst ^= src;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: u64 = 4;

    fn geo(level: Level, members: usize) -> Geometry {
        Geometry::new(level, members, S).unwrap()
    }

    #[test]
    fn member_minimums_are_enforced() {
        assert!(Geometry::new(Level::Raid0, 1, S).is_err());
        assert!(Geometry::new(Level::Raid5, 2, S).is_err());
        assert!(Geometry::new(Level::Raid6, 3, S).is_err());
        assert!(Geometry::new(Level::Raid6, 4, S).is_ok());
        assert!(Geometry::new(Level::Raid1, 2, 0).is_err());
    }

    #[test]
    fn raid0_deals_stripes_round_robin_in_rows() {
        let g = geo(Level::Raid0, 3);
        assert_eq!(
            (0..6).map(|s| g.data_member(s)).collect::<Vec<_>>(),
            [0, 1, 2, 0, 1, 2]
        );
        assert_eq!(g.data_offset(0), 0);
        assert_eq!(g.data_offset(3), S);
        assert_eq!(g.data_offset(5), S);
    }

    #[test]
    fn raid5_parity_rotates_per_group() {
        let g = geo(Level::Raid5, 3);
        assert_eq!(g.parity_members(0), [2]);
        assert_eq!(g.parity_members(1), [1]);
        assert_eq!(g.parity_members(2), [0]);
        assert_eq!(g.data_offset(0), S);
        assert_eq!(g.data_offset(2), 3 * S);
        assert_eq!(g.parity_offset(1), 2 * S);
    }

    #[test]
    fn raid6_parity_pair_alternates_with_group_parity() {
        let g = geo(Level::Raid6, 4);
        assert_eq!(g.parity_members(0), [2, 3]);
        assert_eq!(g.parity_members(1), [3, 0]);
        assert_eq!(g.parity_members(2), [2, 3]);
    }

    #[test]
    fn chunks_split_on_stripe_boundaries() {
        let g = geo(Level::Raid0, 2);
        let chunks = g.chunks(3, 6);
        assert_eq!(
            chunks,
            [
                Chunk { stripe: 0, within: 3, len: 1, buf_offset: 0 },
                Chunk { stripe: 1, within: 0, len: 4, buf_offset: 1 },
                Chunk { stripe: 2, within: 0, len: 1, buf_offset: 5 },
            ]
        );
    }

    #[test]
    fn member_lengths_and_logical_size_agree() {
        for (level, members) in [
            (Level::Raid0, 2),
            (Level::Raid0, 3),
            (Level::Raid1, 2),
            (Level::Raid5, 3),
            (Level::Raid5, 4),
            (Level::Raid6, 4),
            (Level::Raid6, 5),
        ] {
            let g = geo(level, members);
            for size in 0..(S * 13) {
                let lengths: Vec<Option<u64>> =
                    g.member_lengths(size).into_iter().map(Some).collect();
                assert_eq!(g.logical_size(&lengths), size, "{level} x{members} size {size}");
            }
        }
    }

    #[test]
    fn xor_pads_short_blocks_with_zeros() {
        assert_eq!(xor_blocks(&[&[1, 2, 3], &[1]]), [0, 2, 3]);
        assert!(xor_blocks(&[]).is_empty());
    }
}
