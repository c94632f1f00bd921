//! Parsers for rsync's `--itemize-changes` and `--list-only` output.

/// One line of `rsync -i` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemizedChange {
    /// The `YXcstpoguax` field, or `*deleting`.
    pub flags: String,
    pub path: String,
}

impl ItemizedChange {
    /// Whether the line only reports a time or permission update with no
    /// content transfer. Such lines do not make a working tree "changed".
    pub fn is_noop(&self) -> bool {
        let mut chars = self.flags.chars();
        if chars.next() != Some('.') {
            return false;
        }
        // second char is the file type
        chars
            .skip(1)
            .all(|c| matches!(c, '.' | 't' | 'T' | 'p' | ' '))
    }

    pub fn is_deletion(&self) -> bool {
        self.flags.starts_with("*deleting")
    }
}

/// Parse itemized output, ignoring lines that are not itemized records
/// (rsync's summary lines, blank lines).
pub fn parse_itemized(output: &str) -> Vec<ItemizedChange> {
    output.lines().filter_map(parse_itemized_line).collect()
}

fn parse_itemized_line(line: &str) -> Option<ItemizedChange> {
    if line.trim().is_empty() {
        return None;
    }
    // Records are an 11-character flag field, a space, then the name.
    let (flags, path) = match (line.get(..11), line.get(11..12), line.get(12..)) {
        (Some(flags), Some(" "), Some(path)) if !path.is_empty() => (flags.trim_end(), path),
        _ => {
            let (flags, path) = line.split_once(' ')?;
            (flags, path.trim_start())
        }
    };
    let first = flags.chars().next()?;
    if !matches!(first, '<' | '>' | 'c' | 'h' | '.' | '*') {
        return None;
    }
    if first != '*' && flags.chars().count() < 2 {
        return None;
    }
    Some(ItemizedChange {
        flags: flags.to_string(),
        path: path.to_string(),
    })
}

/// Lines that make a working tree differ from its reference commit.
pub fn effective_changes(changes: &[ItemizedChange]) -> Vec<&ItemizedChange> {
    changes.iter().filter(|c| !c.is_noop()).collect()
}

/// One entry of `rsync --list-only`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Parse `--list-only` output, dropping the `.` entry for the listed
/// directory itself.
pub fn parse_listing(output: &str) -> Vec<ListEntry> {
    output
        .lines()
        .filter_map(parse_list_line)
        .filter(|e| e.name != ".")
        .collect()
}

fn parse_list_line(line: &str) -> Option<ListEntry> {
    // permissions, size, date, time, then the name (which may contain spaces)
    let mut rest = line.trim_start();
    let mut perms = "";
    for idx in 0..4 {
        let end = rest.find(char::is_whitespace)?;
        if idx == 0 {
            perms = &rest[..end];
        }
        rest = rest[end..].trim_start();
    }
    if rest.is_empty() || perms.len() < 10 {
        return None;
    }
    let name = match perms.starts_with('l') {
        true => rest.split(" -> ").next().unwrap_or(rest),
        false => rest,
    };
    Some(ListEntry {
        name: name.to_string(),
        is_dir: perms.starts_with('d'),
    })
}
