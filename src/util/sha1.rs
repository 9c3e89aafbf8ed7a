use ::sha1::{Digest, Sha1};

pub const SHA1_LEN: usize = 20;

pub fn sha1_hash(bytes: &[u8]) -> [u8; SHA1_LEN] {
    let digest = Sha1::digest(bytes);
    let mut hash = [0u8; SHA1_LEN];
    hash.copy_from_slice(&digest);
    hash
}
