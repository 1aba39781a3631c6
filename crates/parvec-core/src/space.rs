//! Observation, action and state spaces.
//!
//! A [`Space`] describes the shape of one agent's payload. Spaces compare
//! structurally: two sub-environments are compatible when every
//! per-agent space is `==` to the reference env's.

use rand::Rng;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::id::EnvId;
use crate::value::Value;

/// Shape descriptor for a single agent's observation, action or state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Space {
    /// Integers in `start .. start + n`.
    Discrete {
        /// Number of choices.
        n: u64,
        /// Lowest value.
        start: i64,
    },
    /// A vector of independent discrete choices, `0 .. nvec[i]` each.
    MultiDiscrete {
        /// Number of choices per component.
        nvec: SmallVec<[u64; 4]>,
    },
    /// A fixed-length vector of 0/1 flags.
    MultiBinary {
        /// Number of flags.
        n: usize,
    },
    /// A dense `f32` tensor with uniform bounds.
    Box {
        /// Lower bound for every element.
        low: f32,
        /// Upper bound for every element.
        high: f32,
        /// Tensor shape; the flat length is the product.
        shape: SmallVec<[usize; 4]>,
    },
    /// Concatenation of sub-spaces.
    Tuple(Vec<Space>),
    /// Opaque, environment-defined payload with no fixed layout.
    Custom {
        /// Free-form name used only for equality and diagnostics.
        name: String,
    },
}

impl Space {
    /// Convenience constructor for `Discrete { n, start: 0 }`.
    pub fn discrete(n: u64) -> Self {
        Space::Discrete { n, start: 0 }
    }

    /// Convenience constructor for a `Box` space.
    pub fn boxed(low: f32, high: f32, shape: &[usize]) -> Self {
        Space::Box {
            low,
            high,
            shape: SmallVec::from_slice(shape),
        }
    }

    /// Number of bytes this space occupies in a shared-memory slot.
    ///
    /// `None` when the space has no fixed layout (custom payloads, or a
    /// tuple that contains one). Discrete values are stored as `i64`,
    /// multi-binary flags as one byte each, box elements as `f32`.
    pub fn fixed_byte_len(&self) -> Option<usize> {
        match self {
            Space::Discrete { .. } => Some(8),
            Space::MultiDiscrete { nvec } => Some(8 * nvec.len()),
            Space::MultiBinary { n } => Some(*n),
            Space::Box { shape, .. } => Some(4 * shape.iter().product::<usize>()),
            Space::Tuple(parts) => parts.iter().map(Space::fixed_byte_len).sum(),
            Space::Custom { .. } => None,
        }
    }

    /// Whether `value` is a member of this space.
    ///
    /// Custom spaces accept every value.
    pub fn contains(&self, value: &Value) -> bool {
        match (self, value) {
            (Space::Discrete { n, start }, Value::Int(v)) => {
                *v >= *start && ((*v - *start) as u64) < *n
            }
            (Space::MultiDiscrete { nvec }, Value::Ints(vs)) => {
                vs.len() == nvec.len()
                    && vs.iter().zip(nvec).all(|(v, n)| *v >= 0 && (*v as u64) < *n)
            }
            (Space::MultiBinary { n }, Value::Ints(vs)) => {
                vs.len() == *n && vs.iter().all(|v| *v == 0 || *v == 1)
            }
            (Space::Box { low, high, shape }, Value::Floats(vs)) => {
                vs.len() == shape.iter().product::<usize>()
                    && vs.iter().all(|v| *v >= *low && *v <= *high)
            }
            (Space::Tuple(parts), Value::List(vs)) => {
                parts.len() == vs.len() && parts.iter().zip(vs).all(|(s, v)| s.contains(v))
            }
            (Space::Custom { .. }, _) => true,
            _ => false,
        }
    }

    /// Draw a uniformly random member of this space.
    ///
    /// Custom spaces sample to [`Value::Unit`].
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Value {
        match self {
            Space::Discrete { n, start } => Value::Int(*start + rng.random_range(0..*n) as i64),
            Space::MultiDiscrete { nvec } => Value::Ints(
                nvec.iter()
                    .map(|n| rng.random_range(0..*n) as i64)
                    .collect(),
            ),
            Space::MultiBinary { n } => {
                Value::Ints((0..*n).map(|_| rng.random_bool(0.5) as i64).collect())
            }
            Space::Box { low, high, shape } => {
                let len = shape.iter().product::<usize>();
                Value::Floats((0..len).map(|_| rng.random_range(*low..=*high)).collect())
            }
            Space::Tuple(parts) => Value::List(parts.iter().map(|s| s.sample(rng)).collect()),
            Space::Custom { .. } => Value::Unit,
        }
    }
}

/// A per-agent single space repeated once per env.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchedSpace {
    /// The per-env space.
    pub single: Space,
    /// The envs the space is repeated for, in slot order.
    pub env_ids: Vec<EnvId>,
}

impl BatchedSpace {
    /// Repeat `single` once per env in `env_ids`.
    pub fn new(single: Space, env_ids: Vec<EnvId>) -> Self {
        Self { single, env_ids }
    }

    /// Number of repetitions.
    pub fn len(&self) -> usize {
        self.env_ids.len()
    }

    /// Whether the batch has no envs.
    pub fn is_empty(&self) -> bool {
        self.env_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    // ── Layout ────────────────────────────────────────────────

    #[test]
    fn fixed_byte_len_per_kind() {
        assert_eq!(Space::discrete(5).fixed_byte_len(), Some(8));
        assert_eq!(Space::boxed(0.0, 1.0, &[2, 3]).fixed_byte_len(), Some(24));
        assert_eq!(Space::MultiBinary { n: 7 }.fixed_byte_len(), Some(7));
        let tuple = Space::Tuple(vec![Space::discrete(2), Space::boxed(0.0, 1.0, &[4])]);
        assert_eq!(tuple.fixed_byte_len(), Some(24));
    }

    #[test]
    fn custom_space_has_no_layout() {
        let custom = Space::Custom {
            name: "graph".into(),
        };
        assert_eq!(custom.fixed_byte_len(), None);
        let nested = Space::Tuple(vec![Space::discrete(2), custom]);
        assert_eq!(nested.fixed_byte_len(), None);
    }

    // ── Equality ──────────────────────────────────────────────

    #[test]
    fn structural_equality() {
        assert_eq!(Space::boxed(0.0, 1.0, &[3]), Space::boxed(0.0, 1.0, &[3]));
        assert_ne!(Space::boxed(0.0, 1.0, &[3]), Space::boxed(0.0, 2.0, &[3]));
        assert_ne!(Space::discrete(3), Space::Discrete { n: 3, start: 1 });
    }

    // ── Membership ────────────────────────────────────────────

    #[test]
    fn discrete_contains_respects_start() {
        let s = Space::Discrete { n: 3, start: -1 };
        assert!(s.contains(&Value::Int(-1)));
        assert!(s.contains(&Value::Int(1)));
        assert!(!s.contains(&Value::Int(2)));
        assert!(!s.contains(&Value::Float(0.0)));
    }

    proptest! {
        #[test]
        fn samples_are_members(seed in any::<u64>(), n in 1u64..50, len in 1usize..16) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let spaces = [
                Space::Discrete { n, start: -3 },
                Space::MultiDiscrete { nvec: SmallVec::from_slice(&[n, n + 1]) },
                Space::MultiBinary { n: len },
                Space::boxed(-1.0, 1.0, &[len]),
                Space::Tuple(vec![Space::discrete(n), Space::MultiBinary { n: len }]),
            ];
            for space in &spaces {
                let v = space.sample(&mut rng);
                prop_assert!(space.contains(&v), "{space:?} rejected its own sample {v:?}");
            }
        }
    }
}
