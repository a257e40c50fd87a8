//! Conversion of JS-style (ECMA-262) regular expressions into the grammar
//! IR.
//!
//! The supported subset covers literals, escapes (including `\u{...}` and
//! control escapes `\cJ`), perl character classes, bracketed classes with
//! ranges and negation, `.`, edge anchors, alternation, capturing groups and
//! the `*`/`+`/`?` quantifiers. Backreferences, `(?...)` groups, Unicode
//! property escapes, word boundaries and ranged quantifiers `{x,y}` are
//! rejected with a fatal parse error.
use crate::grammar::{ExprId, ExprView, Grammar, GrammarBuilder, GrammarError};

/// Parses a regular expression into an unnormalized grammar with root rule
/// `root`.
pub(crate) fn parse_regex(pattern: &str) -> Result<Grammar, GrammarError> {
    let mut parser = RegexParser {
        chars: pattern.chars().collect(),
        pos: 0,
        builder: GrammarBuilder::new(),
    };
    parser.parse()
}

/// JS `\d`.
const DIGIT_RANGES: &[(u32, u32)] = &[('0' as u32, '9' as u32)];
/// JS `\w`.
const WORD_RANGES: &[(u32, u32)] = &[
    ('0' as u32, '9' as u32),
    ('A' as u32, 'Z' as u32),
    ('_' as u32, '_' as u32),
    ('a' as u32, 'z' as u32),
];
/// JS `\s` (WhiteSpace and LineTerminator).
const SPACE_RANGES: &[(u32, u32)] = &[
    (0x09, 0x0D),
    (0x20, 0x20),
    (0xA0, 0xA0),
    (0x1680, 0x1680),
    (0x2000, 0x200A),
    (0x2028, 0x2029),
    (0x202F, 0x202F),
    (0x205F, 0x205F),
    (0x3000, 0x3000),
    (0xFEFF, 0xFEFF),
];
/// JS `.` excludes line terminators.
const DOT_EXCLUDED: &[(u32, u32)] = &[(0x0A, 0x0A), (0x0D, 0x0D), (0x2028, 0x2029)];

const MAX_CODEPOINT: u32 = 0x10FFFF;

/// One parsed class item: a literal codepoint or a predefined range set.
enum ClassItem {
    Codepoint(u32),
    Ranges(Vec<(u32, u32)>),
}

struct RegexParser {
    chars: Vec<char>,
    pos: usize,
    builder: GrammarBuilder,
}

impl RegexParser {
    fn parse(mut self) -> Result<Grammar, GrammarError> {
        let root = self.builder.add_rule("root");
        let body = self.parse_disjunction()?;
        if self.pos < self.chars.len() {
            return Err(self.error("Unexpected character")); // stray ')'
        }
        let is_choice = matches!(self.builder.expr(body), ExprView::Choice(_));
        let wrapped = if is_choice { body } else { self.builder.choice(&[body]) };
        self.builder.set_rule_body(root, wrapped);
        self.builder.finalize(root)
    }

    fn error(&self, message: impl Into<String>) -> GrammarError {
        GrammarError::RegexParse { pos: self.pos, message: message.into() }
    }

    #[inline]
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    #[inline]
    fn advance(&mut self) -> Option<char> {
        let ch = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        Some(ch)
    }

    fn parse_disjunction(&mut self) -> Result<ExprId, GrammarError> {
        let mut branches = vec![self.parse_alternative()?];
        while self.peek() == Some('|') {
            self.advance();
            branches.push(self.parse_alternative()?);
        }
        if branches.len() == 1 {
            Ok(branches[0])
        } else {
            Ok(self.builder.choice(&branches))
        }
    }

    fn parse_alternative(&mut self) -> Result<ExprId, GrammarError> {
        let mut elements: Vec<ExprId> = Vec::new();
        loop {
            match self.peek() {
                None | Some('|') | Some(')') => break,
                Some('^') => {
                    if self.pos != 0 {
                        return Err(
                            self.error("Anchor ^ is only supported at the start of the pattern")
                        );
                    }
                    self.advance();
                }
                Some('$') => {
                    if self.pos != self.chars.len() - 1 {
                        return Err(
                            self.error("Anchor $ is only supported at the end of the pattern")
                        );
                    }
                    self.advance();
                }
                Some(_) => {
                    let atom = self.parse_atom()?;
                    let atom = self.parse_quantifier(atom)?;
                    elements.push(atom);
                }
            }
        }
        match elements.len() {
            0 => Ok(self.builder.empty_str()),
            1 => Ok(elements[0]),
            _ => Ok(self.builder.sequence(&elements)),
        }
    }

    fn parse_quantifier(&mut self, atom: ExprId) -> Result<ExprId, GrammarError> {
        let quantifier = match self.peek() {
            Some(q @ ('*' | '+' | '?')) => {
                self.advance();
                q
            }
            Some('{') => {
                return Err(self.error("Ranged quantifier {x,y} is not supported"));
            }
            _ => return Ok(atom),
        };
        // Laziness does not change the recognized language.
        if self.peek() == Some('?') {
            self.advance();
        }
        match quantifier {
            '*' => {
                let class_parts = match self.builder.expr(atom) {
                    ExprView::CharClass { negated, ranges } => Some((
                        negated,
                        ranges
                            .chunks_exact(2)
                            .map(|p| (p[0] as u32, p[1] as u32))
                            .collect::<Vec<_>>(),
                    )),
                    _ => None,
                };
                if let Some((negated, pairs)) = class_parts {
                    return Ok(self.builder.char_class_star(negated, &pairs));
                }
                let helper_name = self.builder.fresh_numbered_name("root");
                let helper = self.builder.add_rule(&helper_name);
                let empty = self.builder.empty_str();
                let recursion = self.builder.rule_ref(helper);
                let step = self.builder.sequence(&[atom, recursion]);
                let body = self.builder.choice(&[empty, step]);
                self.builder.set_rule_body(helper, body);
                Ok(self.builder.rule_ref(helper))
            }
            '+' => {
                let helper_name = self.builder.fresh_numbered_name("root");
                let helper = self.builder.add_rule(&helper_name);
                let recursion = self.builder.rule_ref(helper);
                let step = self.builder.sequence(&[atom, recursion]);
                let body = self.builder.choice(&[step, atom]);
                self.builder.set_rule_body(helper, body);
                Ok(self.builder.rule_ref(helper))
            }
            _ => {
                let helper_name = self.builder.fresh_numbered_name("root");
                let helper = self.builder.add_rule(&helper_name);
                let empty = self.builder.empty_str();
                let body = self.builder.choice(&[empty, atom]);
                self.builder.set_rule_body(helper, body);
                Ok(self.builder.rule_ref(helper))
            }
        }
    }

    fn parse_atom(&mut self) -> Result<ExprId, GrammarError> {
        match self.peek().expect("caller checked non-empty") {
            '(' => {
                self.advance();
                if self.peek() == Some('?') {
                    return Err(self.error(
                        "Non-capturing groups, named groups and assertions (?...) are not supported",
                    ));
                }
                let inner = self.parse_disjunction()?;
                if self.peek() != Some(')') {
                    return Err(self.error("Expect ) to close the group"));
                }
                self.advance();
                Ok(inner)
            }
            '[' => self.parse_class(),
            '.' => {
                self.advance();
                let ranges: Vec<(u32, u32)> =
                    DOT_EXCLUDED.iter().map(|&(lo, hi)| (lo, hi)).collect();
                Ok(self.builder.char_class(true, &ranges))
            }
            '*' | '+' | '?' => Err(self.error("Nothing to repeat")),
            '\\' => {
                self.advance();
                match self.parse_escape_item(false)? {
                    ClassItem::Codepoint(cp) => Ok(self.literal(cp)),
                    ClassItem::Ranges(ranges) => Ok(self.builder.char_class(false, &ranges)),
                }
            }
            ch => {
                self.advance();
                Ok(self.literal(ch as u32))
            }
        }
    }

    fn literal(&mut self, codepoint: u32) -> ExprId {
        match char::from_u32(codepoint) {
            Some(ch) => {
                let mut buf = [0u8; 4];
                let bytes = ch.encode_utf8(&mut buf).as_bytes().to_vec();
                self.builder.byte_string(&bytes)
            }
            None => self.builder.byte_string("\u{FFFD}".as_bytes()),
        }
    }

    /// Parses the escape following a consumed backslash. `in_class` relaxes
    /// the rejection of class-only constructs.
    fn parse_escape_item(&mut self, in_class: bool) -> Result<ClassItem, GrammarError> {
        let ch = self.advance().ok_or_else(|| self.error("Dangling escape at end of pattern"))?;
        let ranges = |r: &[(u32, u32)]| ClassItem::Ranges(r.to_vec());
        match ch {
            '1'..='9' => Err(self.error("Backreferences \\1 are not supported")),
            'k' => Err(self.error("Backreferences \\k<name> are not supported")),
            'p' | 'P' => Err(self.error("Unicode property escapes \\p{...} are not supported")),
            'b' if !in_class => Err(self.error("Word boundary \\b is not supported")),
            'B' => Err(self.error("Word boundary \\B is not supported")),
            'b' => Ok(ClassItem::Codepoint(0x08)),
            'd' => Ok(ranges(DIGIT_RANGES)),
            'D' => Ok(ClassItem::Ranges(complement_ranges(DIGIT_RANGES))),
            'w' => Ok(ranges(WORD_RANGES)),
            'W' => Ok(ClassItem::Ranges(complement_ranges(WORD_RANGES))),
            's' => Ok(ranges(SPACE_RANGES)),
            'S' => Ok(ClassItem::Ranges(complement_ranges(SPACE_RANGES))),
            'n' => Ok(ClassItem::Codepoint(0x0A)),
            'r' => Ok(ClassItem::Codepoint(0x0D)),
            't' => Ok(ClassItem::Codepoint(0x09)),
            'v' => Ok(ClassItem::Codepoint(0x0B)),
            'f' => Ok(ClassItem::Codepoint(0x0C)),
            '0' => Ok(ClassItem::Codepoint(0x00)),
            'x' => {
                let value = self.parse_hex(2)?;
                Ok(ClassItem::Codepoint(value))
            }
            'u' => {
                if self.peek() == Some('{') {
                    self.advance();
                    let mut value: u32 = 0;
                    let mut digits = 0;
                    while let Some(ch) = self.peek() {
                        if ch == '}' {
                            break;
                        }
                        let digit = ch
                            .to_digit(16)
                            .ok_or_else(|| self.error("Invalid \\u{...} escape"))?;
                        value = value.wrapping_shl(4) | digit;
                        digits += 1;
                        self.advance();
                    }
                    if self.peek() != Some('}') || digits == 0 || value > MAX_CODEPOINT {
                        return Err(self.error("Invalid \\u{...} escape"));
                    }
                    self.advance();
                    Ok(ClassItem::Codepoint(value))
                } else {
                    let value = self.parse_hex(4)?;
                    Ok(ClassItem::Codepoint(value))
                }
            }
            'c' => {
                let ch = self
                    .advance()
                    .filter(|c| c.is_ascii_alphabetic())
                    .ok_or_else(|| self.error("Invalid control escape \\c"))?;
                Ok(ClassItem::Codepoint((ch as u32) % 32))
            }
            // Identity escapes for punctuation and anything else.
            other => Ok(ClassItem::Codepoint(other as u32)),
        }
    }

    fn parse_hex(&mut self, count: usize) -> Result<u32, GrammarError> {
        let mut value: u32 = 0;
        for _ in 0..count {
            let digit = self
                .advance()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error("Invalid hexadecimal escape"))?;
            value = value.wrapping_shl(4) | digit;
        }
        Ok(value)
    }

    fn parse_class(&mut self) -> Result<ExprId, GrammarError> {
        self.advance(); // consume '['
        let negated = if self.peek() == Some('^') {
            self.advance();
            true
        } else {
            false
        };
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        let mut first = true;
        loop {
            match self.peek() {
                None => return Err(self.error("Expect ] to close the character class")),
                Some(']') if !first => {
                    self.advance();
                    break;
                }
                Some(_) => {
                    let item = self.parse_class_item()?;
                    match item {
                        ClassItem::Ranges(r) => ranges.extend(r),
                        ClassItem::Codepoint(lo) => {
                            if self.peek() == Some('-')
                                && self.chars.get(self.pos + 1).copied() != Some(']')
                                && self.chars.get(self.pos + 1).is_some()
                            {
                                self.advance();
                                let hi = match self.parse_class_item()? {
                                    ClassItem::Codepoint(hi) => hi,
                                    ClassItem::Ranges(_) => {
                                        return Err(
                                            self.error("Invalid range bound in character class")
                                        )
                                    }
                                };
                                if lo > hi {
                                    return Err(self.error(
                                        "Character class range is out of order",
                                    ));
                                }
                                ranges.push((lo, hi));
                            } else {
                                ranges.push((lo, lo));
                            }
                        }
                    }
                }
            }
            first = false;
        }
        Ok(self.builder.char_class(negated, &ranges))
    }

    fn parse_class_item(&mut self) -> Result<ClassItem, GrammarError> {
        match self.advance().expect("caller checked non-empty") {
            '\\' => self.parse_escape_item(true),
            ch => Ok(ClassItem::Codepoint(ch as u32)),
        }
    }
}

/// Complements a sorted range set within the codepoint space.
fn complement_ranges(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut result = Vec::with_capacity(ranges.len() + 1);
    let mut next = 0u32;
    for &(lo, hi) in ranges {
        if lo > next {
            result.push((next, lo - 1));
        }
        next = hi + 1;
    }
    if next <= MAX_CODEPOINT {
        result.push((next, MAX_CODEPOINT));
    }
    result
}
