use anyhow::{Context, Result, ensure};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Loads a word image into signed 32-bit integers.
pub fn load_words<P: AsRef<Path>>(path: P) -> Result<Vec<i32>> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open word image {}", path.display()))?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    ensure!(
        buffer.len() % 4 == 0,
        "word image {} is {} bytes, not a whole number of words",
        path.display(),
        buffer.len()
    );

    // Little endian regardless of host, so images move between boards.
    Ok(buffer
        .chunks_exact(4)
        .map(|w| i32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect())
}

/// Writes signed 32-bit integers as a word image.
pub fn save_words<P: AsRef<Path>>(path: P, words: &[i32]) -> Result<()> {
    let path = path.as_ref();
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create word image {}", path.display()))?;
    file.write_all(&bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_are_little_endian_words() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        save_words(&path, &[1, -2, 0x0102_0304]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[8..], &[4, 3, 2, 1]);
        assert_eq!(load_words(&path).unwrap(), vec![1, -2, 0x0102_0304]);
    }

    #[test]
    fn truncated_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [0u8; 6]).unwrap();
        let err = load_words(&path).unwrap_err();
        assert!(err.to_string().contains("6 bytes"));
    }
}
