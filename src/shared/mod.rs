pub mod chunk_payload;
pub mod protocol;
pub mod spatial;
pub mod voxel;
