//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mirrormap.
//
// Mirrormap is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Mirrormap is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mirrormap. If not, see <http://www.gnu.org/licenses/>.

/// Determine whether the given name is safe to use as a single file system
/// element.
///
/// This is used to validate user ids and message ids before they become file
/// names in the per-user data directory. It excludes empty names and patterns
/// that cause directory traversal or hidden files.
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty() &&
        // Block directory traversal through .. and creation of hidden files on
        // UNIX
        name.chars().next() != Some('.') &&
        name.find('/').is_none() &&
        name.find('\\').is_none() &&
        name.find(|c| c < ' ' || c == '\x7F').is_none()
}

/// Determine whether a single mailbox name component is acceptable.
///
/// Components may not be empty, may not contain control characters, and may
/// not contain the IMAP wildcards `*` and `%` since those would make the
/// mailbox impossible to address in `LIST`.
pub fn is_safe_mailbox_component(name: &str) -> bool {
    !name.is_empty()
        && name.find(|c| c < ' ' || c == '\x7F').is_none()
        && name.find(|c| c == '*' || c == '%').is_none()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_is_safe_file_name() {
        assert!(is_safe_file_name("foo"));
        assert!(is_safe_file_name("0d4c6a1e-7b3f-4a55-9d2c-7e8b0f7d1c11"));
        assert!(is_safe_file_name("foo.bar"));
        assert!(!is_safe_file_name(""));
        assert!(!is_safe_file_name("."));
        assert!(!is_safe_file_name(".."));
        assert!(!is_safe_file_name("foo/bar"));
        assert!(!is_safe_file_name("foo\\bar"));
        assert!(!is_safe_file_name("foo\0"));
    }

    #[test]
    fn test_is_safe_mailbox_component() {
        assert!(is_safe_mailbox_component("Entwürfe"));
        assert!(is_safe_mailbox_component("folder #1"));
        assert!(is_safe_mailbox_component(".hidden"));
        assert!(!is_safe_mailbox_component(""));
        assert!(!is_safe_mailbox_component("foo*bar"));
        assert!(!is_safe_mailbox_component("foo%bar"));
        assert!(!is_safe_mailbox_component("fo\ro"));
    }
}
