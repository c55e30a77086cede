pub mod debug_image;
