// Copyright 2019-2021 Meridb Developers.
// This file is part of Meridb.

// Meridb is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Meridb is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Meridb.  If not, see <http://www.gnu.org/licenses/>.

/// Longest permitted database object name.
pub const MAX_OBJECT_NAME_LENGTH: usize = 255;

/// Checks a database/table/column/index name: ASCII letter or underscore
/// first, then letters, digits and underscores, at most
/// [`MAX_OBJECT_NAME_LENGTH`] bytes.
pub fn is_valid_object_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_OBJECT_NAME_LENGTH {
        return false;
    }
    let mut chars = name.chars();
    let first = chars.next().expect("name is non-empty; qed");
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::is_valid_object_name;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(is_valid_object_name("T"));
        assert!(is_valid_object_name("SYS_TABLES"));
        assert!(is_valid_object_name("_hidden"));
        assert!(is_valid_object_name("a1_b2"));
    }

    #[test]
    fn rejects_bad_identifiers() {
        assert!(!is_valid_object_name(""));
        assert!(!is_valid_object_name("1abc"));
        assert!(!is_valid_object_name("with space"));
        assert!(!is_valid_object_name("semi;colon"));
        assert!(!is_valid_object_name(&"x".repeat(256)));
    }
}
