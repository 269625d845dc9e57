//! Tar records for remote archives.

use crate::error::{StorageError, StorageResult};
use tar::{EntryType, Header};

/// Tar block size.
pub const BLOCK_SIZE: u64 = 512;

/// Longest name that fits in the ustar name field.
const NAME_FIELD_LEN: usize = 100;

/// Zero bytes needed to bring `len` up to a block boundary.
pub fn padding_len(len: u64) -> u64 {
    (BLOCK_SIZE - len % BLOCK_SIZE) % BLOCK_SIZE
}

/// Two zero blocks marking the end of an archive.
pub fn end_of_archive() -> [u8; 2 * BLOCK_SIZE as usize] {
    [0; 2 * BLOCK_SIZE as usize]
}

/// Header record(s) for a regular file member of `size` payload bytes.
///
/// Names longer than the ustar name field are preceded by a GNU long-name
/// record, so the result is either one or three blocks long.
pub fn member_header(name: &str, size: u64, mtime: u64) -> StorageResult<Vec<u8>> {
    let name = name.trim_start_matches('/');
    if name.is_empty() || name.contains('\0') {
        return Err(StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid archive member name {name:?}"),
        )));
    }

    let mut out = Vec::with_capacity(3 * BLOCK_SIZE as usize);
    let name_bytes = name.as_bytes();

    if name_bytes.len() > NAME_FIELD_LEN {
        let mut long_name = Header::new_gnu();
        write_name(&mut long_name, b"././@LongLink");
        long_name.set_mode(0o644);
        long_name.set_mtime(0);
        long_name.set_entry_type(EntryType::GNULongName);
        // The long name is stored NUL-terminated.
        long_name.set_size(name_bytes.len() as u64 + 1);
        long_name.set_cksum();

        out.extend_from_slice(long_name.as_bytes());
        out.extend_from_slice(name_bytes);
        out.push(0);
        let pad = padding_len(name_bytes.len() as u64 + 1) as usize;
        out.resize(out.len() + pad, 0);
    }

    let mut header = Header::new_ustar();
    write_name(&mut header, &name_bytes[..name_bytes.len().min(NAME_FIELD_LEN)]);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_size(size);
    header.set_entry_type(EntryType::Regular);
    header.set_cksum();
    out.extend_from_slice(header.as_bytes());

    Ok(out)
}

fn write_name(header: &mut Header, name: &[u8]) {
    let field = &mut header.as_old_mut().name;
    field.fill(0);
    field[..name.len()].copy_from_slice(name);
}
