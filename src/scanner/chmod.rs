//! `chmod` spec parser and mode transformer.
//!
//! Ported field-for-field from
//! `original_source/src/dwarfs/chmod_transformer.cpp`, which itself follows
//! GNU coreutils' `chmod(1)` grammar: an octal literal, or a symbolic spec
//! (`ugoa` whom + `=+-` operator + `rwxXst` bits, or `u`/`g`/`o` copy-from).

use crate::error::ScanError;

pub type ModeType = u32;

const SETUID: ModeType = 0o4000;
const SETGID: ModeType = 0o2000;
const STICKY: ModeType = 0o1000;
const USER_R: ModeType = 0o400;
const USER_W: ModeType = 0o200;
const USER_X: ModeType = 0o100;
const GROUP_R: ModeType = 0o040;
const GROUP_W: ModeType = 0o020;
const GROUP_X: ModeType = 0o010;
const OTHER_R: ModeType = 0o004;
const OTHER_W: ModeType = 0o002;
const OTHER_X: ModeType = 0o001;

const ALL_UID_BITS: ModeType = SETUID | SETGID;
const ALL_USER_BITS: ModeType = USER_R | USER_W | USER_X;
const ALL_GROUP_BITS: ModeType = GROUP_R | GROUP_W | GROUP_X;
const ALL_OTHER_BITS: ModeType = OTHER_R | OTHER_W | OTHER_X;
const ALL_READ_BITS: ModeType = USER_R | GROUP_R | OTHER_R;
const ALL_WRITE_BITS: ModeType = USER_W | GROUP_W | OTHER_W;
const ALL_EXEC_BITS: ModeType = USER_X | GROUP_X | OTHER_X;
const ALL_RWX_BITS: ModeType = ALL_READ_BITS | ALL_WRITE_BITS | ALL_EXEC_BITS;
const ALL_MODE_BITS: ModeType =
    ALL_UID_BITS | STICKY | ALL_USER_BITS | ALL_GROUP_BITS | ALL_OTHER_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpMode {
    Normal,
    PromoteExec,
    CopyFrom,
}

#[derive(Debug, Clone, Copy)]
struct Modifier {
    oper: char,
    mode: OpMode,
    whom: ModeType,
    bits: ModeType,
    mask: ModeType,
}

/// A parsed `--chmod` modifier list, applicable to many files without
/// re-parsing the spec string each time.
#[derive(Debug, Clone)]
pub struct ChmodTransformer {
    modifiers: Vec<Modifier>,
    dirs_only: bool,
    files_only: bool,
    umask: ModeType,
}

fn is_op(c: char) -> bool {
    c == '=' || c == '+' || c == '-'
}

fn is_ugo(c: char) -> bool {
    c == 'u' || c == 'g' || c == 'o'
}

/// Consume a leading run of octal digits from `spec`, returning the parsed
/// value if it fits within the mode bits. Leaves `spec` untouched on
/// failure.
fn parse_oct(spec: &mut &str) -> Option<ModeType> {
    let digits: String = spec.chars().take_while(|c| ('0'..='7').contains(c)).collect();
    if digits.is_empty() {
        return None;
    }
    let mode = ModeType::from_str_radix(&digits, 8).ok()?;
    if mode > ALL_MODE_BITS {
        return None;
    }
    *spec = &spec[digits.len()..];
    Some(mode)
}

/// Consume the `ugoaDF` whom prefix. Returns `Some(whom)` once an operator
/// is reached (without consuming it); `None` if an invalid character is
/// found or the spec runs out before any operator.
fn parse_whom(spec: &mut &str, dirs_only: &mut bool, files_only: &mut bool) -> Option<ModeType> {
    let mut whom: ModeType = 0;
    loop {
        let mut chars = spec.chars();
        let c = chars.next()?;
        match c {
            'u' => whom |= SETUID | ALL_USER_BITS,
            'g' => whom |= SETGID | ALL_GROUP_BITS,
            'o' => whom |= STICKY | ALL_OTHER_BITS,
            'a' => whom = ALL_MODE_BITS,
            'D' => *dirs_only = true,
            'F' => *files_only = true,
            '=' | '+' | '-' => return Some(whom),
            _ => return None,
        }
        *spec = chars.as_str();
    }
}

impl ChmodTransformer {
    /// Parse a `chmod(1)`-style spec (octal or symbolic) against `umask`.
    pub fn parse(spec: &str, umask: ModeType) -> Result<Self, ScanError> {
        if spec.is_empty() {
            return Err(ScanError::BadChmodSpec("empty mode".to_string()));
        }
        let orig = spec;
        let mut rest = spec;
        let mut dirs_only = false;
        let mut files_only = false;
        let mut modifiers = Vec::new();

        if rest.starts_with(|c: char| ('0'..='7').contains(&c)) {
            let mode = parse_oct(&mut rest).ok_or_else(|| ScanError::BadChmodSpec(orig.to_string()))?;
            if !rest.is_empty() {
                return Err(ScanError::BadChmodSpec(orig.to_string()));
            }
            let mask = if orig.len() > 4 {
                ALL_MODE_BITS
            } else {
                (mode & ALL_UID_BITS) | STICKY | ALL_RWX_BITS
            };
            modifiers.push(Modifier {
                oper: '=',
                mode: OpMode::Normal,
                whom: ALL_MODE_BITS,
                bits: mode,
                mask,
            });
            return Ok(Self {
                modifiers,
                dirs_only,
                files_only,
                umask,
            });
        }

        let whom = parse_whom(&mut rest, &mut dirs_only, &mut files_only)
            .ok_or_else(|| ScanError::BadChmodSpec(orig.to_string()))?;
        let mask = if whom != 0 { whom } else { ALL_MODE_BITS };

        while rest.starts_with(is_op) {
            let op = rest.chars().next().unwrap();
            rest = &rest[op.len_utf8()..];
            if rest.is_empty() {
                return Err(ScanError::BadChmodSpec(orig.to_string()));
            }

            let mut probe = rest;
            if let Some(mode) = parse_oct(&mut probe) {
                // Only a bare whom-less octal operand is permitted here
                // (`chmod(1)` allows e.g. `=644` but not `u=644`).
                if whom != 0 || !probe.is_empty() {
                    return Err(ScanError::BadChmodSpec(orig.to_string()));
                }
                modifiers.push(Modifier {
                    oper: op,
                    mode: OpMode::Normal,
                    whom: ALL_MODE_BITS,
                    bits: mode,
                    mask: ALL_MODE_BITS,
                });
                rest = probe;
                break;
            }

            let next = rest.chars().next().unwrap();
            if is_ugo(next) {
                let bits = match next {
                    'u' => ALL_USER_BITS,
                    'g' => ALL_GROUP_BITS,
                    'o' => ALL_OTHER_BITS,
                    _ => unreachable!(),
                };
                modifiers.push(Modifier {
                    oper: op,
                    mode: OpMode::CopyFrom,
                    whom,
                    bits,
                    mask: bits & mask,
                });
                rest = &rest[next.len_utf8()..];
            } else {
                let mut mode = OpMode::Normal;
                let mut bits: ModeType = 0;
                loop {
                    let Some(c) = rest.chars().next() else { break };
                    match c {
                        'r' => bits |= ALL_READ_BITS,
                        'w' => bits |= ALL_WRITE_BITS,
                        'x' => bits |= ALL_EXEC_BITS,
                        's' => bits |= ALL_UID_BITS,
                        't' => bits |= STICKY,
                        'X' => mode = OpMode::PromoteExec,
                        _ => break,
                    }
                    rest = &rest[c.len_utf8()..];
                }
                modifiers.push(Modifier {
                    oper: op,
                    mode,
                    whom,
                    bits,
                    mask: bits & mask,
                });
            }
        }

        if !rest.is_empty() {
            return Err(ScanError::BadChmodSpec(orig.to_string()));
        }

        Ok(Self {
            modifiers,
            dirs_only,
            files_only,
            umask,
        })
    }

    /// Apply every modifier in order, returning the transformed mode, or
    /// `None` if this spec doesn't apply to this entry kind (`D`/`F` flags).
    pub fn transform(&self, mode: ModeType, is_dir: bool) -> Option<ModeType> {
        if (self.dirs_only && !is_dir) || (self.files_only && is_dir) {
            return None;
        }

        let mut mode = mode;
        for m in &self.modifiers {
            let omit = if is_dir { ALL_UID_BITS & !m.mask } else { 0 };
            let mut bits = m.bits;

            match m.mode {
                OpMode::Normal => {}
                OpMode::PromoteExec => {
                    if is_dir || (mode & ALL_EXEC_BITS) != 0 {
                        bits |= ALL_EXEC_BITS;
                    }
                }
                OpMode::CopyFrom => {
                    bits &= mode;
                    if bits & ALL_READ_BITS != 0 {
                        bits |= ALL_READ_BITS;
                    }
                    if bits & ALL_WRITE_BITS != 0 {
                        bits |= ALL_WRITE_BITS;
                    }
                    if bits & ALL_EXEC_BITS != 0 {
                        bits |= ALL_EXEC_BITS;
                    }
                }
            }

            let whom_mask = if m.whom != 0 { m.whom } else { !self.umask };
            bits &= whom_mask & !omit;

            mode = match m.oper {
                '=' => {
                    let keep_mask = if m.whom != 0 { !m.whom } else { 0 } | omit;
                    (mode & keep_mask) | bits
                }
                '+' => mode | bits,
                '-' => mode & !bits,
                _ => unreachable!(),
            };
        }

        Some(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octal_spec_sets_mode_exactly() {
        let t = ChmodTransformer::parse("755", 0).unwrap();
        assert_eq!(t.transform(0o100644, false), Some(0o100755));
    }

    #[test]
    fn four_digit_octal_sets_setuid_too() {
        let t = ChmodTransformer::parse("4755", 0).unwrap();
        assert_eq!(t.transform(0o100644, false), Some(0o104755));
    }

    #[test]
    fn symbolic_add_exec_to_all() {
        let t = ChmodTransformer::parse("a+x", 0).unwrap();
        assert_eq!(t.transform(0o100644, false), Some(0o100755));
    }

    #[test]
    fn symbolic_user_write_only() {
        let t = ChmodTransformer::parse("u+w", 0).unwrap();
        assert_eq!(t.transform(0o100444, false), Some(0o100644));
    }

    #[test]
    fn symbolic_remove_group_other() {
        let t = ChmodTransformer::parse("go-rwx", 0).unwrap();
        assert_eq!(t.transform(0o100777, false), Some(0o100700));
    }

    #[test]
    fn promote_exec_only_if_any_exec_bit_set() {
        let t = ChmodTransformer::parse("a+X", 0).unwrap();
        assert_eq!(t.transform(0o100644, false), Some(0o100644));
        assert_eq!(t.transform(0o100744, false), Some(0o100755));
    }

    #[test]
    fn promote_exec_always_applies_to_directories() {
        let t = ChmodTransformer::parse("a+X", 0).unwrap();
        assert_eq!(t.transform(0o40644, true), Some(0o40755));
    }

    #[test]
    fn copy_from_group_mirrors_group_bits_onto_other() {
        let t = ChmodTransformer::parse("o=g", 0).unwrap();
        assert_eq!(t.transform(0o100640, false), Some(0o100644));
    }

    #[test]
    fn dirs_only_flag_skips_files() {
        let t = ChmodTransformer::parse("Da+x", 0).unwrap();
        assert_eq!(t.transform(0o100644, false), None);
        assert_eq!(t.transform(0o40644, true), Some(0o40755));
    }

    #[test]
    fn files_only_flag_skips_dirs() {
        let t = ChmodTransformer::parse("Fa+x", 0).unwrap();
        assert_eq!(t.transform(0o40644, true), None);
        assert_eq!(t.transform(0o100644, false), Some(0o100755));
    }

    #[test]
    fn empty_spec_is_rejected() {
        assert!(ChmodTransformer::parse("", 0).is_err());
    }

    #[test]
    fn garbage_spec_is_rejected() {
        assert!(ChmodTransformer::parse("u+zzz!!", 0).is_err());
    }
}
