//! Structural layer digest (tarsum v0).
//!
//! Every archive entry is hashed as a canonical header string followed by its content, the
//! entry hashes are sorted, and the final digest covers the metadata document followed by
//! the sorted hashes. Entry order and archive framing therefore don't matter.

use std::io::{self, BufReader, Read, Seek, SeekFrom};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const DIRTYPE: u8 = b'5';

/// Compute `tarsum+sha256:<hex>` for a plain or gzip-compressed tar archive.
///
/// An empty input is an archive without entries. A malformed archive is an error.
pub(crate) fn compute<R: Read + Seek>(mut layer: R, json: &[u8]) -> io::Result<String> {
    layer.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 2];
    let read = read_prefix(&mut layer, &mut magic)?;
    layer.seek(SeekFrom::Start(0))?;

    let hashes = if read == 0 {
        Vec::new()
    } else if read == magic.len() && magic == GZIP_MAGIC {
        entry_hashes(GzDecoder::new(BufReader::new(layer)))?
    } else {
        entry_hashes(BufReader::new(layer))?
    };

    let mut digest = Sha256::new();
    digest.update(json);
    for hash in &hashes {
        digest.update(hash.as_bytes());
    }
    Ok(format!("tarsum+sha256:{}", hex::encode(digest.finalize())))
}

fn read_prefix<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn entry_hashes<R: Read>(reader: R) -> io::Result<Vec<String>> {
    let mut archive = tar::Archive::new(reader);
    let mut hashes = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let mut hasher = Sha256::new();
        hasher.update(canonical_header(&entry)?.as_bytes());
        io::copy(&mut entry, &mut hasher)?;
        hashes.push(hex::encode(hasher.finalize()));
    }

    hashes.sort();
    Ok(hashes)
}

fn text(bytes: Option<&[u8]>) -> String {
    bytes
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default()
}

/// `name{}mode{}uid{}gid{}size{}mtime{}typeflag{}linkname{}uname{}gname{}devmajor{}devminor{}`
fn canonical_header<R: Read>(entry: &tar::Entry<'_, R>) -> io::Result<String> {
    let header = entry.header();
    let mut name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

    // Old-style archives mark directories with a regular typeflag and a trailing slash.
    let mut typeflag = header.as_old().linkflag[0];
    let is_dir = typeflag == DIRTYPE || (typeflag == b'\0' && name.ends_with('/'));
    if is_dir {
        typeflag = DIRTYPE;
        let trimmed = name.trim_end_matches('/').len();
        name.truncate(trimmed);
        name.push('/');
    }

    let linkname = entry
        .link_name_bytes()
        .map(|link| String::from_utf8_lossy(&link).into_owned())
        .unwrap_or_default();

    Ok(format!(
        "name{name}mode{mode}uid{uid}gid{gid}size{size}mtime{mtime}typeflag{typeflag}linkname{linkname}uname{uname}gname{gname}devmajor{devmajor}devminor{devminor}",
        mode = header.mode()?,
        uid = header.uid()?,
        gid = header.gid()?,
        size = entry.size(),
        mtime = header.mtime()?,
        typeflag = char::from(typeflag),
        uname = text(header.username_bytes()),
        gname = text(header.groupname_bytes()),
        devmajor = header.device_major().ok().flatten().unwrap_or(0),
        devminor = header.device_minor().ok().flatten().unwrap_or(0),
    ))
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use super::*;

    const JSON: &[u8] = br#"{"id":"abc"}"#;

    fn file_header(path: &str, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_size(size);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(1_380_000_000);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        header
    }

    fn dir_header(path: &str) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_size(0);
        header.set_mode(0o755);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(1_380_000_000);
        header.set_entry_type(tar::EntryType::Directory);
        header.set_cksum();
        header
    }

    fn archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&dir_header("etc/"), io::empty()).unwrap();
        for (path, data) in files {
            builder
                .append(&file_header(path, data.len() as u64), *data)
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn tarsum(data: &[u8], json: &[u8]) -> io::Result<String> {
        compute(Cursor::new(data), json)
    }

    #[test]
    fn entry_order_does_not_matter() {
        let forward = archive(&[("etc/hosts", b"127.0.0.1\n"), ("etc/motd", b"hi\n")]);
        let backward = archive(&[("etc/motd", b"hi\n"), ("etc/hosts", b"127.0.0.1\n")]);

        let sum = tarsum(&forward, JSON).unwrap();
        assert!(sum.starts_with("tarsum+sha256:"));
        assert_eq!(sum.len(), "tarsum+sha256:".len() + 64);
        assert_eq!(sum, tarsum(&backward, JSON).unwrap());
    }

    #[test]
    fn content_and_metadata_change_the_digest() {
        let base = archive(&[("etc/motd", b"hi\n")]);
        let changed = archive(&[("etc/motd", b"ho\n")]);

        assert_ne!(tarsum(&base, JSON).unwrap(), tarsum(&changed, JSON).unwrap());
        assert_ne!(
            tarsum(&base, JSON).unwrap(),
            tarsum(&base, br#"{"id":"def"}"#).unwrap()
        );
    }

    #[test]
    fn gzip_is_transparent() {
        let plain = archive(&[("etc/motd", b"hi\n")]);
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&plain).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(
            tarsum(&plain, JSON).unwrap(),
            tarsum(&compressed, JSON).unwrap()
        );
    }

    #[test]
    fn empty_layer_digests_json_only() {
        let expected = format!("tarsum+sha256:{}", hex::encode(Sha256::digest(JSON)));
        assert_eq!(tarsum(b"", JSON).unwrap(), expected);
    }

    #[test]
    fn entry_hash_uses_canonical_header() {
        let data = archive(&[("etc/motd", b"hi\n")]);

        let dir = "nameetc/mode493uid0gid0size0mtime1380000000typeflag5linknameunamegnamedevmajor0devminor0";
        let file = "nameetc/motdmode420uid0gid0size3mtime1380000000typeflag0linknameunamegnamedevmajor0devminor0";
        let mut hashes = vec![
            hex::encode(Sha256::digest(dir.as_bytes())),
            hex::encode(Sha256::new_with_prefix(file.as_bytes()).chain_update(b"hi\n").finalize()),
        ];
        hashes.sort();

        let mut digest = Sha256::new_with_prefix(JSON);
        for hash in &hashes {
            digest.update(hash.as_bytes());
        }
        let expected = format!("tarsum+sha256:{}", hex::encode(digest.finalize()));

        assert_eq!(tarsum(&data, JSON).unwrap(), expected);
    }

    #[test]
    fn malformed_archive_is_an_error() {
        let garbage = vec![0x42u8; 1024];
        assert!(tarsum(&garbage, JSON).is_err());
    }
}
