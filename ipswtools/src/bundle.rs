// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use log::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::Error;

/// An IPSW firmware bundle on disk.
///
/// The bundle is a ZIP archive addressed by member path. Members are looked
/// up through the central directory, so archives whose stored order differs
/// from their directory order behave the same. The archive is reopened per
/// extraction rather than held in memory: the filesystem image member alone
/// can run to several gigabytes.
#[derive(Debug)]
pub struct FirmwareBundle {
    path: PathBuf,
}

impl FirmwareBundle {
    /// Opens the bundle and validates that it is a readable ZIP archive.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        let bundle = Self { path };
        bundle.archive()?;
        Ok(bundle)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn archive(&self) -> Result<ZipArchive<BufReader<File>>, Error> {
        let file = File::open(&self.path)
            .map_err(|e| Error::FileReadFailed(self.path.clone(), e))?;
        Ok(ZipArchive::new(BufReader::new(file))?)
    }

    /// Reads a member fully into memory.
    pub fn extract_to_memory(&self, name: &str) -> Result<Vec<u8>, Error> {
        let mut archive = self.archive()?;
        let mut member = archive.by_name(name).map_err(|e| match e {
            ZipError::FileNotFound => Error::ArchiveMember(name.to_owned()),
            other => Error::Zip(other),
        })?;
        let mut buffer = Vec::with_capacity(member.size() as usize);
        member
            .read_to_end(&mut buffer)
            .map_err(|e| Error::FileReadFailed(self.path.clone(), e))?;
        debug!("extracted {} ({} bytes) from bundle", name, buffer.len());
        Ok(buffer)
    }

    /// Streams a member to `dst` without buffering it in memory. Used for
    /// the filesystem image, which is far too large to extract in core.
    pub fn extract_to_file(&self, name: &str, dst: &Path) -> Result<(), Error> {
        let mut archive = self.archive()?;
        let mut member = archive.by_name(name).map_err(|e| match e {
            ZipError::FileNotFound => Error::ArchiveMember(name.to_owned()),
            other => Error::Zip(other),
        })?;
        if let Some(parent) = dst.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::FileWriteFailed(dst.to_owned(), e))?;
            }
        }
        let mut out = File::create(dst)
            .map_err(|e| Error::FileWriteFailed(dst.to_owned(), e))?;
        let written = std::io::copy(&mut member, &mut out)
            .map_err(|e| Error::FileWriteFailed(dst.to_owned(), e))?;
        debug!("extracted {} ({} bytes) to {}", name, written, dst.display());
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::build_zip;
    use super::*;
    use std::io::Write;

    fn write_bundle(members: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&build_zip(members)).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn extracts_member_to_memory() {
        let file = write_bundle(&[("BuildManifest.plist", b"manifest")]);
        let bundle = FirmwareBundle::open(file.path()).unwrap();
        let data = bundle.extract_to_memory("BuildManifest.plist").unwrap();
        assert_eq!(data, b"manifest");
    }

    #[test]
    fn missing_member_is_reported_by_path() {
        let file = write_bundle(&[("other", b"x")]);
        let bundle = FirmwareBundle::open(file.path()).unwrap();
        match bundle.extract_to_memory("BuildManifest.plist") {
            Err(Error::ArchiveMember(path)) => {
                assert_eq!(path, "BuildManifest.plist")
            }
            other => panic!("expected ArchiveMember, got {other:?}"),
        }
    }

    #[test]
    fn empty_bundle_is_missing_the_manifest() {
        let file = write_bundle(&[]);
        let bundle = FirmwareBundle::open(file.path()).unwrap();
        assert!(matches!(
            bundle.extract_to_memory("BuildManifest.plist"),
            Err(Error::ArchiveMember(_))
        ));
    }

    #[test]
    fn extracts_member_to_file() {
        let file = write_bundle(&[("018-3790-2.dmg", b"filesystem image")]);
        let bundle = FirmwareBundle::open(file.path()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("018-3790-2.dmg");
        bundle.extract_to_file("018-3790-2.dmg", &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"filesystem image");
    }

    #[test]
    fn not_a_zip_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not a zip").unwrap();
        assert!(FirmwareBundle::open(file.path()).is_err());
    }
}
