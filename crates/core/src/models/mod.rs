pub mod part_vit;

pub use part_vit::{Embeddings, PartVit};
