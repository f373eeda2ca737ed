pub mod helpers;
mod tests_background;
