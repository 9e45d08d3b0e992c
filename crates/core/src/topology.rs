//! 2D torus topology: rank positions, neighbor resolution and rank mappings.
//!
//! Ranks are laid out row-major on an `x_dim * y_dim` grid whose edges wrap
//! around, so every rank has exactly four neighbors (some of which may be the
//! same rank, or the rank itself, on degenerate grids).

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Number of neighbors every rank exchanges ghost data with.
pub const NEIGHBOR_COUNT: usize = 4;

/// Global identity of a simulated application rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rank(u32);

impl Rank {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a neighbor on the torus, also used as the outgoing port name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    Right,
    Left,
    Down,
    Up,
}

impl Direction {
    /// Issue order used when a rank sends its ghost data.
    pub const ALL: [Direction; NEIGHBOR_COUNT] =
        [Direction::Right, Direction::Left, Direction::Down, Direction::Up];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::Right => "right",
            Direction::Left => "left",
            Direction::Down => "down",
            Direction::Up => "up",
        };
        f.write_str(name)
    }
}

/// The four torus neighbors of a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NeighborSet {
    pub left: Rank,
    pub right: Rank,
    pub up: Rank,
    pub down: Rank,
}

impl NeighborSet {
    pub fn get(&self, direction: Direction) -> Rank {
        match direction {
            Direction::Right => self.right,
            Direction::Left => self.left,
            Direction::Down => self.down,
            Direction::Up => self.up,
        }
    }

    /// Neighbors in send order.
    pub fn iter(&self) -> impl Iterator<Item = (Direction, Rank)> + '_ {
        Direction::ALL.into_iter().map(|d| (d, self.get(d)))
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.iter().any(|(_, r)| r == rank)
    }
}

/// Validated torus dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TorusDims {
    x_dim: u32,
    y_dim: u32,
}

impl TorusDims {
    /// Dimensions are taken signed so that non-positive inputs coming from
    /// configuration are rejected rather than wrapped.
    pub fn new(x_dim: i64, y_dim: i64) -> Result<Self, ConfigError> {
        if x_dim <= 0 || y_dim <= 0 {
            return Err(ConfigError::NonPositiveDims { x_dim, y_dim });
        }
        let (Ok(x), Ok(y)) = (u32::try_from(x_dim), u32::try_from(y_dim)) else {
            return Err(ConfigError::DimsOverflow { x_dim, y_dim });
        };
        if x.checked_mul(y).is_none() {
            return Err(ConfigError::DimsOverflow { x_dim, y_dim });
        }
        Ok(Self { x_dim: x, y_dim: y })
    }

    pub fn x_dim(&self) -> u32 {
        self.x_dim
    }

    pub fn y_dim(&self) -> u32 {
        self.y_dim
    }

    /// Total number of ranks on the torus.
    pub fn size(&self) -> u32 {
        // checked at construction
        self.x_dim * self.y_dim
    }

    pub fn contains(&self, rank: Rank) -> bool {
        rank.0 < self.size()
    }

    /// Validates a raw rank id against the torus.
    pub fn rank(&self, id: i64) -> Result<Rank, ConfigError> {
        match u32::try_from(id) {
            Ok(id) if id < self.size() => Ok(Rank(id)),
            _ => Err(ConfigError::RankOutOfRange {
                rank: id,
                size: self.size(),
            }),
        }
    }

    pub fn ranks(&self) -> impl Iterator<Item = Rank> {
        (0..self.size()).map(Rank)
    }

    /// `(x, y)` grid position of a rank.
    pub fn position(&self, rank: Rank) -> (u32, u32) {
        (rank.0 % self.x_dim, rank.0 / self.x_dim)
    }

    fn at(&self, x: u32, y: u32) -> Rank {
        Rank(x + y * self.x_dim)
    }

    pub fn neighbors(&self, rank: Rank) -> Result<NeighborSet, ConfigError> {
        if !self.contains(rank) {
            return Err(ConfigError::RankOutOfRange {
                rank: rank.0.into(),
                size: self.size(),
            });
        }
        let (x, y) = self.position(rank);
        let (xd, yd) = (self.x_dim, self.y_dim);
        Ok(NeighborSet {
            right: self.at((x + 1) % xd, y),
            left: self.at((x + xd - 1) % xd, y),
            down: self.at(x, (y + 1) % yd),
            up: self.at(x, (y + yd - 1) % yd),
        })
    }
}

impl fmt::Display for TorusDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.x_dim, self.y_dim)
    }
}

/// Resolves the four torus neighbors of `rank` on an `x_dim * y_dim` grid.
pub fn neighbors(rank: i64, x_dim: i64, y_dim: i64) -> Result<NeighborSet, ConfigError> {
    let dims = TorusDims::new(x_dim, y_dim)?;
    let rank = dims.rank(rank)?;
    dims.neighbors(rank)
}

/// Strategy translating a logical id range onto another id space.
///
/// `Identity` maps every id onto itself within a single range starting at 0,
/// `Dense` maps any number of disjoint `[from, from + range)` blocks onto
/// `[to, to + range)`. Lookups that fall outside every block yield `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankMap {
    Identity {
        size: u32,
    },
    Dense {
        /// Block starts map to `Some(target)`, block ends to `None`.
        bounds: BTreeMap<u32, Option<u32>>,
    },
}

impl RankMap {
    /// An identity map with no range configured yet.
    pub fn identity() -> Self {
        RankMap::Identity { size: 0 }
    }

    /// An identity map covering `[0, size)`.
    pub fn identity_of(size: u32) -> Self {
        RankMap::Identity { size }
    }

    pub fn dense() -> Self {
        RankMap::Dense {
            bounds: BTreeMap::new(),
        }
    }

    /// Number of ids covered, measured as the highest mapped bound.
    pub fn size(&self) -> u32 {
        match self {
            RankMap::Identity { size } => *size,
            RankMap::Dense { bounds } => bounds.keys().next_back().copied().unwrap_or(0),
        }
    }

    pub fn init_mapping(&mut self, from: u32, to: u32, range: u32) -> Result<(), ConfigError> {
        if range == 0 {
            return Err(ConfigError::InvalidMapping(format!(
                "empty range starting at {from}"
            )));
        }
        let end = from.checked_add(range).ok_or_else(|| {
            ConfigError::InvalidMapping(format!("range {from}+{range} overflows"))
        })?;
        to.checked_add(range).ok_or_else(|| {
            ConfigError::InvalidMapping(format!("target range {to}+{range} overflows"))
        })?;

        match self {
            RankMap::Identity { size } => {
                if from != to {
                    return Err(ConfigError::InvalidMapping(format!(
                        "identity mapping cannot move {from} to {to}"
                    )));
                }
                if from != 0 || *size != 0 {
                    return Err(ConfigError::InvalidMapping(
                        "identity mapping takes a single range starting at 0".into(),
                    ));
                }
                *size = range;
                Ok(())
            }
            RankMap::Dense { bounds } => {
                let starts_inside = Self::dense_lookup(bounds, from).is_some();
                let covers_existing = bounds
                    .range(from..end)
                    .any(|(_, target)| target.is_some());
                if starts_inside || covers_existing {
                    return Err(ConfigError::InvalidMapping(format!(
                        "range [{from}, {end}) overlaps an existing range"
                    )));
                }
                bounds.insert(from, Some(to));
                // keep the start of an adjacent block if one begins right here
                bounds.entry(end).or_insert(None);
                Ok(())
            }
        }
    }

    pub fn map(&self, from: u32) -> Option<u32> {
        match self {
            RankMap::Identity { size } => (from < *size).then_some(from),
            RankMap::Dense { bounds } => Self::dense_lookup(bounds, from),
        }
    }

    fn dense_lookup(bounds: &BTreeMap<u32, Option<u32>>, from: u32) -> Option<u32> {
        let (start, target) = bounds.range(..=from).next_back()?;
        target.map(|to| to + (from - start))
    }
}

impl Default for RankMap {
    fn default() -> Self {
        Self::identity()
    }
}
