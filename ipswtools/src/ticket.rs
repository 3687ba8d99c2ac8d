// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use plist::{Dictionary, Value};

use crate::{props, Error};

/// How to locate a component inside the ticket.
///
/// Component names and archive paths address the same entries but are not
/// interchangeable: several names may share a path, while a path resolves
/// to the first entry carrying it in ticket order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector<'a> {
    Name(&'a str),
    Path(&'a str),
}

/// A resolved ticket entry: the manifest name of the component, its
/// archive-relative path, and the signature blob issued for this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEntry {
    pub name: String,
    pub path: String,
    pub blob: Vec<u8>,
}

/// The signing authority's response, indexed by component.
///
/// Top-level entries are dictionaries carrying at least `Path` and `Blob`.
/// The distinguished `OS` entry instead nests `Info.Path`, announcing where
/// the filesystem image lives inside the bundle; it is skipped by
/// path-based scans.
#[derive(Debug, Clone)]
pub struct Ticket {
    root: Dictionary,
}

impl Ticket {
    pub fn from_value(value: Value, context: &str) -> Result<Self, Error> {
        let root = props::as_dict(&value, context)?.clone();
        Ok(Self { root })
    }

    /// Resolves one entry by name or by path.
    pub fn entry(&self, selector: Selector) -> Result<SignedEntry, Error> {
        match selector {
            Selector::Name(name) => self.by_name(name),
            Selector::Path(path) => self.by_path(path),
        }
    }

    /// Fetches the top-level entry `name` and reads its `Path` and `Blob`.
    pub fn by_name(&self, name: &str) -> Result<SignedEntry, Error> {
        let node = self
            .root
            .get(name)
            .ok_or_else(|| Error::TicketEntryMissing(name.to_owned()))?;
        let entry = node
            .as_dictionary()
            .ok_or(Error::TicketEntryMalformed(name.to_owned(), "not a dictionary"))?;
        let (path, blob) = read_entry(name, entry)?;
        Ok(SignedEntry {
            name: name.to_owned(),
            path,
            blob,
        })
    }

    /// Linear scan for the first entry whose `Path` equals `path`.
    ///
    /// Entries that are not path-addressed (non-dictionaries, or
    /// dictionaries without a `Path` key, such as `OS`) are skipped; an
    /// entry whose `Path` exists but is not a string is malformed.
    pub fn by_path(&self, path: &str) -> Result<SignedEntry, Error> {
        for (name, node) in props::entries(&self.root) {
            let Some(entry) = node.as_dictionary() else {
                continue;
            };
            let Some(path_node) = entry.get("Path") else {
                continue;
            };
            let entry_path = path_node.as_string().ok_or(Error::TicketEntryMalformed(
                name.to_owned(),
                "`Path` is not a string",
            ))?;
            if entry_path == path {
                let (path, blob) = read_entry(name, entry)?;
                return Ok(SignedEntry {
                    name: name.to_owned(),
                    path,
                    blob,
                });
            }
        }
        Err(Error::TicketPathMissing(path.to_owned()))
    }

    /// Archive paths of every path-addressed entry, in ticket order.
    /// Used to assemble the NOR bundle from the flash directory.
    pub fn entry_paths(&self) -> Vec<String> {
        self.root
            .iter()
            .filter_map(|(_, node)| node.as_dictionary())
            .filter_map(|entry| entry.get("Path"))
            .filter_map(|path| path.as_string().map(str::to_owned))
            .collect()
    }

    /// The bundle path of the filesystem image, from `OS.Info.Path`.
    pub fn os_image_path(&self) -> Result<String, Error> {
        os_image_path(&self.root, "ticket")
    }
}

fn read_entry(name: &str, entry: &Dictionary) -> Result<(String, Vec<u8>), Error> {
    let path = entry
        .get("Path")
        .ok_or(Error::TicketEntryMalformed(name.to_owned(), "missing `Path`"))?
        .as_string()
        .ok_or(Error::TicketEntryMalformed(
            name.to_owned(),
            "`Path` is not a string",
        ))?;
    let blob = entry
        .get("Blob")
        .ok_or(Error::TicketEntryMalformed(name.to_owned(), "missing `Blob`"))?
        .as_data()
        .ok_or(Error::TicketEntryMalformed(
            name.to_owned(),
            "`Blob` is not a data blob",
        ))?;
    Ok((path.to_owned(), blob.to_vec()))
}

/// Reads `OS.Info.Path` out of a ticket or a signing request dictionary.
pub(crate) fn os_image_path(root: &Dictionary, context: &str) -> Result<String, Error> {
    let os = props::as_dict(
        props::dict_get(root, "OS", context)?,
        &format!("{context} `OS`"),
    )?;
    let info = props::as_dict(
        props::dict_get(os, "Info", &format!("{context} `OS`"))?,
        &format!("{context} `OS.Info`"),
    )?;
    Ok(props::as_string(
        props::dict_get(info, "Path", &format!("{context} `OS.Info`"))?,
        &format!("{context} `OS.Info.Path`"),
    )?
    .to_owned())
}


#[cfg(test)]
mod tests {
    use super::testutil::{os_entry, signed_entry};
    use super::*;

    fn sample() -> Ticket {
        let mut root = Dictionary::new();
        root.insert("OS".into(), os_entry("018-3790-2.dmg"));
        root.insert(
            "iBEC".into(),
            signed_entry("Firmware/dfu/iBEC.m68ap.RELEASE.dfu", &[1; 8]),
        );
        root.insert(
            "KernelCache".into(),
            signed_entry("kernelcache.release.m68", &[2; 8]),
        );
        // Two names sharing one path; iteration order breaks the tie.
        root.insert(
            "RestoreRamdisk".into(),
            signed_entry("018-3792-2.dmg", &[3; 8]),
        );
        root.insert("Ramdisk".into(), signed_entry("018-3792-2.dmg", &[4; 8]));
        Ticket { root }
    }

    #[test]
    fn by_name_yields_path_and_blob() {
        let entry = sample().by_name("KernelCache").unwrap();
        assert_eq!(entry.path, "kernelcache.release.m68");
        assert_eq!(entry.blob, vec![2; 8]);
    }

    #[test]
    fn missing_name_is_reported() {
        match sample().by_name("AppleLogo") {
            Err(Error::TicketEntryMissing(name)) => assert_eq!(name, "AppleLogo"),
            other => panic!("expected TicketEntryMissing, got {other:?}"),
        }
    }

    #[test]
    fn by_path_finds_the_first_match_in_ticket_order() {
        let entry = sample().by_path("018-3792-2.dmg").unwrap();
        assert_eq!(entry.name, "RestoreRamdisk");
        assert_eq!(entry.blob, vec![3; 8]);
    }

    #[test]
    fn by_path_skips_the_os_entry() {
        // `OS` has no top-level `Path`; the scan must pass over it rather
        // than reject the ticket.
        assert!(matches!(
            sample().by_path("no/such/member"),
            Err(Error::TicketPathMissing(_))
        ));
    }

    #[test]
    fn name_and_path_lookups_agree() {
        let ticket = sample();
        let by_name = ticket.by_name("iBEC").unwrap();
        let by_path = ticket.by_path(&by_name.path).unwrap();
        assert_eq!(by_path.name, "iBEC");
        assert_eq!(by_path.blob, by_name.blob);
    }

    #[test]
    fn lookups_are_idempotent() {
        let ticket = sample();
        assert_eq!(
            ticket.by_name("iBEC").unwrap(),
            ticket.by_name("iBEC").unwrap()
        );
        assert_eq!(
            ticket.by_path("018-3792-2.dmg").unwrap(),
            ticket.by_path("018-3792-2.dmg").unwrap()
        );
        assert_eq!(
            ticket.entry(Selector::Name("iBEC")).unwrap(),
            ticket.by_name("iBEC").unwrap()
        );
    }

    #[test]
    fn entry_with_wrong_blob_kind_is_malformed() {
        let mut root = Dictionary::new();
        let mut entry = Dictionary::new();
        entry.insert("Path".into(), Value::String("a/b".into()));
        entry.insert("Blob".into(), Value::String("not data".into()));
        root.insert("iBEC".into(), Value::Dictionary(entry));
        let ticket = Ticket { root };
        assert!(matches!(
            ticket.by_name("iBEC"),
            Err(Error::TicketEntryMalformed(_, _))
        ));
        assert!(matches!(
            ticket.by_path("a/b"),
            Err(Error::TicketEntryMalformed(_, _))
        ));
    }

    #[test]
    fn os_image_path_reads_the_nested_info() {
        assert_eq!(sample().os_image_path().unwrap(), "018-3790-2.dmg");
    }
}
