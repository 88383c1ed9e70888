use std::fmt::Debug;

use camino::Utf8PathBuf;

/// 32 bytes length generic hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Identity of a single task input: where it lives and what its contents
/// hashed to when the task last processed it.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Fingerprint {
    pub path: Utf8PathBuf,
    pub hash: Hash32,
}

impl Fingerprint {
    pub fn new(path: impl Into<Utf8PathBuf>, hash: Hash32) -> Self {
        Self {
            path: path.into(),
            hash,
        }
    }

    /// Fingerprint a file on disk by its current contents.
    pub fn of_file(path: impl Into<Utf8PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let hash = Hash32::hash_file(&path)?;
        Ok(Self { path, hash })
    }
}
