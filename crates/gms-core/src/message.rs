//! The contract every message family implements.

use crate::error::GmsResult;
use std::fmt::Debug;
use std::hash::Hash;

/// A closed family of typed messages sharing one wire discriminator space.
///
/// `decode` must be exact: malformed input, unknown kinds and trailing bytes
/// are `GmsError::Decode`, never a default value.
pub trait Message: Debug + Send + Sized + 'static {
    /// The kind discriminator of this family.
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;

    fn encode(&self) -> GmsResult<Vec<u8>>;

    fn decode(data: &[u8]) -> GmsResult<Self>;
}
