pub mod attention;
pub mod block;
pub mod drop_path;
pub mod mlp;
pub mod patch_embed;

pub use attention::Attention;
pub use block::Block;
pub use drop_path::{decay_schedule, DropPath};
pub use mlp::Mlp;
pub use patch_embed::PatchEmbed;
