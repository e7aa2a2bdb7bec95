//! Per-value vector shapes (the result of divergence/shape analysis).

use serde::Serialize;
use std::fmt;

/// How a value varies across the lanes of a vector.
///
/// Shapes form a lattice, with [`VectorShape::Undef`] at the bottom ("nothing
/// known yet") and [`VectorShape::Varying`] at the top, see [`VectorShape::join`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default, Serialize)]
pub enum VectorShape {
    /// Not (yet) analyzed, only safe to treat as "not uniform".
    #[default]
    Undef,

    /// The same value in every lane.
    Uniform { align: u32 },

    /// `lane_value = lane0_value + lane_idx * stride` (`stride != 0`).
    Strided { stride: i64, align: u32 },

    /// No known relationship between lanes.
    Varying { align: u32 },
}

impl VectorShape {
    pub fn uni() -> Self {
        Self::Uniform { align: 1 }
    }

    pub fn varying() -> Self {
        Self::Varying { align: 1 }
    }

    pub fn undef() -> Self {
        Self::Undef
    }

    /// Strided shape, where a `0` stride is the same as uniform.
    pub fn strided(stride: i64) -> Self {
        match stride {
            0 => Self::uni(),
            _ => Self::Strided { stride, align: 1 },
        }
    }

    /// Contiguous (i.e. strided by `1`).
    pub fn cont() -> Self {
        Self::strided(1)
    }

    pub fn with_alignment(self, align: u32) -> Self {
        let align = align.max(1);
        match self {
            Self::Undef => Self::Undef,
            Self::Uniform { .. } => Self::Uniform { align },
            Self::Strided { stride, .. } => Self::Strided { stride, align },
            Self::Varying { .. } => Self::Varying { align },
        }
    }

    pub fn alignment(self) -> u32 {
        match self {
            Self::Undef => 1,
            Self::Uniform { align } | Self::Strided { align, .. } | Self::Varying { align } => {
                align
            }
        }
    }

    pub fn is_defined(self) -> bool {
        self != Self::Undef
    }

    pub fn is_uniform(self) -> bool {
        matches!(self, Self::Uniform { .. })
    }

    pub fn is_varying(self) -> bool {
        matches!(self, Self::Varying { .. })
    }

    pub fn stride(self) -> Option<i64> {
        match self {
            Self::Uniform { .. } => Some(0),
            Self::Strided { stride, .. } => Some(stride),
            Self::Undef | Self::Varying { .. } => None,
        }
    }

    /// Least upper bound of two shapes, i.e. the most precise shape that
    /// describes a value that could be either of `self` or `other`.
    pub fn join(self, other: Self) -> Self {
        match (self, other) {
            (Self::Undef, x) | (x, Self::Undef) => x,
            (Self::Uniform { align: a }, Self::Uniform { align: b }) => {
                Self::Uniform { align: gcd(a, b) }
            }
            (Self::Strided { stride: s1, align: a }, Self::Strided { stride: s2, align: b })
                if s1 == s2 =>
            {
                Self::Strided { stride: s1, align: gcd(a, b) }
            }
            (a, b) => Self::Varying { align: gcd(a.alignment(), b.alignment()) },
        }
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.max(1)
}

impl fmt::Display for VectorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Undef => return f.write_str("undef"),
            Self::Uniform { .. } => f.write_str("U")?,
            Self::Strided { stride, .. } => write!(f, "S{stride}")?,
            Self::Varying { .. } => f.write_str("V")?,
        }
        match self.alignment() {
            1 => Ok(()),
            align => write!(f, "a{align}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_is_a_lattice() {
        let shapes = [
            VectorShape::undef(),
            VectorShape::uni(),
            VectorShape::uni().with_alignment(4),
            VectorShape::cont(),
            VectorShape::strided(2),
            VectorShape::varying(),
        ];
        for a in shapes {
            assert_eq!(a.join(VectorShape::undef()), a);
            assert_eq!(a.join(a), a);
            assert!(a.join(VectorShape::varying()).is_varying());
            for b in shapes {
                assert_eq!(a.join(b), b.join(a));
            }
        }
    }

    #[test]
    fn mismatched_shapes_become_varying() {
        assert_eq!(VectorShape::uni().join(VectorShape::cont()), VectorShape::varying());
        assert_eq!(VectorShape::strided(2).join(VectorShape::cont()), VectorShape::varying());
        assert_eq!(
            VectorShape::uni().with_alignment(8).join(VectorShape::uni().with_alignment(12)),
            VectorShape::uni().with_alignment(4)
        );
    }

    #[test]
    fn zero_stride_is_uniform() {
        assert!(VectorShape::strided(0).is_uniform());
        assert_eq!(VectorShape::strided(0).stride(), Some(0));
        assert_eq!(VectorShape::varying().stride(), None);
        assert_eq!(VectorShape::cont().with_alignment(4).to_string(), "S1a4");
    }
}
