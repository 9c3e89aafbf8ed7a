pub mod bencode;
pub mod file;
pub mod tracker;

#[cfg(test)]
mod tests;
