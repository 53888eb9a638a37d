//! # Filestore Module
//!
//! The [VirtualFilestore] abstracts all file system access of the engine. The file sender reads
//! file segments and calculates the file checksum with it, the file receiver uses it to persist
//! completed files and to verify their checksum.
use spacepackets::cfdp::ChecksumType;
#[cfg(feature = "std")]
pub use std_mod::*;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FilestoreError {
    #[error("file does not exist")]
    FileDoesNotExist,
    #[error("file already exists")]
    FileAlreadyExists,
    #[error("is not a file")]
    IsNotFile,
    #[error("path is not valid UTF-8")]
    InvalidPath,
    #[error("buffer too small, expected at least {expected} bytes, found {found}")]
    BufferTooSmall { expected: usize, found: usize },
    #[error("IO error: {0}")]
    #[cfg(feature = "std")]
    Io(#[from] std::io::Error),
    #[error("checksum type not implemented: {0:?}")]
    ChecksumTypeNotImplemented(ChecksumType),
}

pub trait VirtualFilestore {
    fn create_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    /// Truncating a file means deleting all its data so the resulting file is empty.
    /// This can be more efficient than removing and re-creating a file.
    fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    /// Creates a directory including all missing parent directories.
    fn create_dir_all(&self, dir_path: &str) -> Result<(), FilestoreError>;

    fn read_data(
        &self,
        file_path: &str,
        offset: u64,
        read_len: u64,
        buf: &mut [u8],
    ) -> Result<(), FilestoreError>;

    fn write_data(&self, file: &str, offset: u64, buf: &[u8]) -> Result<(), FilestoreError>;

    fn is_file(&self, path: &str) -> Result<bool, FilestoreError>;

    fn exists(&self, path: &str) -> Result<bool, FilestoreError>;

    fn file_size(&self, path: &str) -> Result<u64, FilestoreError>;

    /// Replaces the content of a file with the passed data. The file is created if it does not
    /// exist yet.
    fn write_file(&self, file_path: &str, data: &[u8]) -> Result<(), FilestoreError> {
        if self.exists(file_path)? {
            self.truncate_file(file_path)?;
        } else {
            self.create_file(file_path)?;
        }
        self.write_data(file_path, 0, data)
    }

    /// This special function is the CFDP specific abstraction to calculate the checksum of a file.
    /// This allows to keep OS specific details like reading the whole file in the most efficient
    /// manner inside the file system abstraction.
    ///
    /// The passed verification buffer argument will be used by the specific implementation as
    /// a buffer to read the file into. It is recommended to use common buffer sizes like
    /// 4096 or 8192 bytes.
    fn calculate_checksum(
        &self,
        file_path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<u32, FilestoreError>;

    /// Verifies the checksum of a file, see [Self::calculate_checksum].
    fn checksum_verify(
        &self,
        expected_checksum: u32,
        file_path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<bool, FilestoreError> {
        Ok(
            self.calculate_checksum(file_path, checksum_type, size_to_verify, verification_buf)?
                == expected_checksum,
        )
    }
}

/// Running CFDP modular checksum as specified in annex F of the CFDP standard.
///
/// The data is interpreted as a sequence of big endian 32 bit words which are added with
/// wrapping arithmetic. The last word is padded with zeroes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModularChecksum {
    sum: u32,
    pending: [u8; 4],
    pending_len: usize,
}

impl ModularChecksum {
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let to_copy = (4 - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + to_copy]
                .copy_from_slice(&data[..to_copy]);
            self.pending_len += to_copy;
            data = &data[to_copy..];
            if self.pending_len == 4 {
                self.sum = self.sum.wrapping_add(u32::from_be_bytes(self.pending));
                self.pending_len = 0;
            }
        }
    }

    pub fn finalize(mut self) -> u32 {
        if self.pending_len > 0 {
            self.pending[self.pending_len..].fill(0);
            self.sum = self.sum.wrapping_add(u32::from_be_bytes(self.pending));
        }
        self.sum
    }
}

#[cfg(feature = "std")]
pub mod std_mod {

    use crc::Crc;

    use crate::{CRC_32, CRC_32C};

    use super::*;
    use std::{
        fs::{self, File, OpenOptions},
        io::{BufReader, Read, Seek, SeekFrom, Write},
        path::Path,
    };

    #[derive(Debug, Default, Clone, Copy)]
    pub struct NativeFilestore;

    impl VirtualFilestore for NativeFilestore {
        fn create_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            if self.exists(file_path)? {
                return Err(FilestoreError::FileAlreadyExists);
            }
            File::create(file_path)?;
            Ok(())
        }

        fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            if !self.is_file(file_path)? {
                return Err(FilestoreError::IsNotFile);
            }
            fs::remove_file(file_path)?;
            Ok(())
        }

        fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            if !self.is_file(file_path)? {
                return Err(FilestoreError::IsNotFile);
            }
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(file_path)?;
            Ok(())
        }

        fn create_dir_all(&self, dir_path: &str) -> Result<(), FilestoreError> {
            fs::create_dir_all(dir_path)?;
            Ok(())
        }

        fn read_data(
            &self,
            file_name: &str,
            offset: u64,
            read_len: u64,
            buf: &mut [u8],
        ) -> Result<(), FilestoreError> {
            if (buf.len() as u64) < read_len {
                return Err(FilestoreError::BufferTooSmall {
                    expected: read_len as usize,
                    found: buf.len(),
                });
            }
            if !self.is_file(file_name)? {
                return Err(FilestoreError::IsNotFile);
            }
            let mut file = File::open(file_name)?;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf[0..read_len as usize])?;
            Ok(())
        }

        fn write_data(&self, file: &str, offset: u64, buf: &[u8]) -> Result<(), FilestoreError> {
            if !self.is_file(file)? {
                return Err(FilestoreError::IsNotFile);
            }
            let mut file = OpenOptions::new().write(true).open(file)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)?;
            Ok(())
        }

        fn is_file(&self, str_path: &str) -> Result<bool, FilestoreError> {
            let path = Path::new(str_path);
            if !path.exists() {
                return Err(FilestoreError::FileDoesNotExist);
            }
            Ok(path.is_file())
        }

        fn exists(&self, path: &str) -> Result<bool, FilestoreError> {
            Ok(Path::new(path).exists())
        }

        fn file_size(&self, str_path: &str) -> Result<u64, FilestoreError> {
            if !self.is_file(str_path)? {
                return Err(FilestoreError::IsNotFile);
            }
            Ok(Path::new(str_path).metadata()?.len())
        }

        fn calculate_checksum(
            &self,
            file_path: &str,
            checksum_type: ChecksumType,
            size_to_verify: u64,
            verification_buf: &mut [u8],
        ) -> Result<u32, FilestoreError> {
            if checksum_type == ChecksumType::NullChecksum {
                return Ok(0);
            }
            if verification_buf.is_empty() && size_to_verify > 0 {
                return Err(FilestoreError::BufferTooSmall {
                    expected: 1,
                    found: 0,
                });
            }
            let calc_with_crc_lib = |crc: Crc<u32>,
                                     verification_buf: &mut [u8]|
             -> Result<u32, FilestoreError> {
                let mut digest = crc.digest();
                read_chunks(file_path, size_to_verify, verification_buf, &mut |chunk| {
                    digest.update(chunk)
                })?;
                Ok(digest.finalize())
            };
            match checksum_type {
                ChecksumType::Modular => {
                    let mut checksum = ModularChecksum::default();
                    read_chunks(file_path, size_to_verify, verification_buf, &mut |chunk| {
                        checksum.update(chunk)
                    })?;
                    Ok(checksum.finalize())
                }
                ChecksumType::Crc32 => calc_with_crc_lib(CRC_32, verification_buf),
                ChecksumType::Crc32C => calc_with_crc_lib(CRC_32C, verification_buf),
                _ => Err(FilestoreError::ChecksumTypeNotImplemented(checksum_type)),
            }
        }
    }

    /// Reads up to `size` bytes of a file chunk by chunk and passes each chunk to `consume`.
    fn read_chunks(
        file_path: &str,
        size: u64,
        buf: &mut [u8],
        consume: &mut dyn FnMut(&[u8]),
    ) -> Result<(), FilestoreError> {
        let mut buf_reader = BufReader::new(File::open(file_path)?);
        let mut remaining_bytes = size;
        while remaining_bytes > 0 {
            let bytes_to_read = remaining_bytes.min(buf.len() as u64) as usize;
            let bytes_read = buf_reader.read(&mut buf[0..bytes_to_read])?;
            if bytes_read == 0 {
                break;
            }
            consume(&buf[0..bytes_read]);
            remaining_bytes -= bytes_read as u64;
        }
        Ok(())
    }

    /// Converts a path into the string representation used by the [VirtualFilestore] API.
    pub fn path_to_str(path: &Path) -> Result<&str, FilestoreError> {
        path.to_str().ok_or(FilestoreError::InvalidPath)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, string::ToString};

    use super::*;
    use alloc::format;
    use tempfile::tempdir;

    const EXAMPLE_DATA_CFDP: [u8; 15] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
    ];

    const NATIVE_FS: NativeFilestore = NativeFilestore;

    #[test]
    fn test_basic_native_filestore_create() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        let path = path_to_str(&file_path).unwrap();
        NATIVE_FS.create_file(path).unwrap();
        assert!(NATIVE_FS.exists(path).unwrap());
        assert!(NATIVE_FS.is_file(path).unwrap());
        assert!(matches!(
            NATIVE_FS.create_file(path).unwrap_err(),
            FilestoreError::FileAlreadyExists
        ));
    }

    #[test]
    fn test_basic_native_fs_write_and_read() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        let path = path_to_str(&file_path).unwrap();
        NATIVE_FS.create_file(path).unwrap();
        NATIVE_FS.write_data(path, 0, b"Hello World!").unwrap();
        assert_eq!(NATIVE_FS.file_size(path).unwrap(), 12);
        let mut buf = [0; 5];
        NATIVE_FS.read_data(path, 6, 5, &mut buf).unwrap();
        assert_eq!(&buf, b"World");
        assert!(matches!(
            NATIVE_FS.read_data(path, 0, 10, &mut buf).unwrap_err(),
            FilestoreError::BufferTooSmall {
                expected: 10,
                found: 5
            }
        ));
    }

    #[test]
    fn test_write_file_replaces_content() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        let path = path_to_str(&file_path).unwrap();
        NATIVE_FS.write_file(path, b"a longer first content").unwrap();
        NATIVE_FS.write_file(path, b"short").unwrap();
        assert_eq!(fs::read(&file_path).unwrap(), b"short");
    }

    #[test]
    fn test_remove_and_truncate_file() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        let path = path_to_str(&file_path).unwrap();
        fs::write(&file_path, b"data").unwrap();
        NATIVE_FS.truncate_file(path).unwrap();
        assert_eq!(NATIVE_FS.file_size(path).unwrap(), 0);
        NATIVE_FS.remove_file(path).unwrap();
        assert!(!NATIVE_FS.exists(path).unwrap());
        assert!(matches!(
            NATIVE_FS.remove_file(path).unwrap_err(),
            FilestoreError::FileDoesNotExist
        ));
        assert!(matches!(
            NATIVE_FS.truncate_file(path).unwrap_err(),
            FilestoreError::FileDoesNotExist
        ));
    }

    #[test]
    fn test_operations_on_dir() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let dir_path = tmpdir.path().join("nested/dir");
        let path = path_to_str(&dir_path).unwrap();
        NATIVE_FS.create_dir_all(path).unwrap();
        assert!(!NATIVE_FS.is_file(path).unwrap());
        assert!(matches!(
            NATIVE_FS.write_data(path, 0, b"x").unwrap_err(),
            FilestoreError::IsNotFile
        ));
        assert!(matches!(
            NATIVE_FS.file_size(path).unwrap_err(),
            FilestoreError::IsNotFile
        ));
    }

    #[test]
    fn test_modular_checksum() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("mod-crc.bin");
        fs::write(file_path.as_path(), EXAMPLE_DATA_CFDP).expect("writing test file failed");
        // The numbers were verified manually.
        let mut checksum: u32 = 0;
        for i in 0..3 {
            let word: [u8; 4] = EXAMPLE_DATA_CFDP[i * 4..(i + 1) * 4].try_into().unwrap();
            checksum = checksum.wrapping_add(u32::from_be_bytes(word));
        }
        checksum = checksum.wrapping_add(u32::from_be_bytes([0x0C, 0x0D, 0x0E, 0]));
        // A verification buffer which is not a multiple of 4 bytes.
        let mut verif_buf: [u8; 7] = [0; 7];
        let result = NATIVE_FS.checksum_verify(
            checksum,
            file_path.to_str().unwrap(),
            ChecksumType::Modular,
            EXAMPLE_DATA_CFDP.len() as u64,
            &mut verif_buf,
        );
        assert!(result.unwrap());
    }

    #[test]
    fn test_modular_checksum_streaming() {
        let mut chunked = ModularChecksum::default();
        chunked.update(&EXAMPLE_DATA_CFDP[0..3]);
        chunked.update(&EXAMPLE_DATA_CFDP[3..9]);
        chunked.update(&EXAMPLE_DATA_CFDP[9..]);
        let mut whole = ModularChecksum::default();
        whole.update(&EXAMPLE_DATA_CFDP);
        assert_eq!(chunked.finalize(), whole.finalize());
        assert_eq!(ModularChecksum::default().finalize(), 0);
    }

    #[test]
    fn test_crc32_checksum() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("crc.bin");
        fs::write(file_path.as_path(), b"123456789").unwrap();
        let mut verif_buf: [u8; 4] = [0; 4];
        let checksum = NATIVE_FS
            .calculate_checksum(
                file_path.to_str().unwrap(),
                ChecksumType::Crc32,
                9,
                &mut verif_buf,
            )
            .unwrap();
        assert_eq!(checksum, 0xCBF43926);
        let checksum = NATIVE_FS
            .calculate_checksum(
                file_path.to_str().unwrap(),
                ChecksumType::Crc32C,
                9,
                &mut verif_buf,
            )
            .unwrap();
        assert_eq!(checksum, 0xE3069283);
    }

    #[test]
    fn test_null_checksum_impl() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("mod-crc.bin");
        // The file to check does not even need to exist, and the verification buffer can be
        // empty: the null checksum always yields the same result.
        let result = NATIVE_FS.checksum_verify(
            0,
            file_path.to_str().unwrap(),
            ChecksumType::NullChecksum,
            0,
            &mut [],
        );
        assert!(result.unwrap());
    }

    #[test]
    fn test_checksum_not_implemented() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("mod-crc.bin");
        let result = NATIVE_FS.checksum_verify(
            0,
            file_path.to_str().unwrap(),
            ChecksumType::Crc32Proximity1,
            0,
            &mut [],
        );
        let error = result.unwrap_err();
        if let FilestoreError::ChecksumTypeNotImplemented(cksum_type) = error {
            assert_eq!(
                error.to_string(),
                format!("checksum type not implemented: {:?}", cksum_type)
            );
        } else {
            panic!("unexpected error");
        }
    }
}
