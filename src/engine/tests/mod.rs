pub mod helpers;
mod tests_rebuild;
mod tests_rotation;
