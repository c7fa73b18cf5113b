pub mod db;
pub mod events;
pub mod share_image;
pub mod solana;
