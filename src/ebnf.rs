//! The EBNF text parser.
//!
//! Accepts a W3C-style EBNF notation with extensions: `#` line comments,
//! C-style escapes (`\xHH`, `\uXXXX`, `\UXXXXXXXX`), character classes with
//! negation, quantifiers `*`/`+`/`?` and bounded repetition `{m,n}`,
//! grouping, alternation, a trailing lookahead assertion `(=...)`, and the
//! `TagDispatch(...)` terminal. Every error is fatal and carries the
//! 1-based line and column where it was detected.
//!
//! `*`, `+` and `?` are lowered at parse time into synthesized helper rules
//! named `<rule>_<n>` (with a direct `CharClassStar` fast path for
//! `[class]*`); `{m,n}` parses into a `RepeatRange` node that the normalizer
//! expands.
use crate::grammar::{
    ExprId, ExprView, Grammar, GrammarBuilder, GrammarError, RuleId, TagDispatchSpec,
};

/// Parses EBNF text into an unnormalized grammar.
pub(crate) fn parse_ebnf(input: &str, root_rule_name: &str) -> Result<Grammar, GrammarError> {
    let mut parser = EbnfParser {
        input: input.as_bytes(),
        pos: 0,
        line: 1,
        col: 1,
        builder: GrammarBuilder::new(),
        cur_rule_name: String::new(),
        root_rule_name,
        tag_dispatch_exprs: Vec::new(),
    };
    parser.parse()
}

struct EbnfParser<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
    builder: GrammarBuilder,
    cur_rule_name: String,
    root_rule_name: &'a str,
    tag_dispatch_exprs: Vec<ExprId>,
}

enum EscapeValue {
    /// A raw byte, emitted verbatim (only meaningful inside strings).
    Byte(u8),
    /// A Unicode codepoint, emitted as UTF-8.
    Codepoint(u32),
}

impl<'a> EbnfParser<'a> {
    fn parse(mut self) -> Result<Grammar, GrammarError> {
        self.register_rule_names();
        loop {
            self.skip_whitespace_multiline();
            if self.peek().is_none() {
                break;
            }
            self.parse_rule()?;
        }
        let root = match self.builder.rule_id(self.root_rule_name) {
            Some(root) => root,
            None => {
                return Err(self.error(format!(
                    "The root rule with name \"{}\" is not found.",
                    self.root_rule_name
                )))
            }
        };
        let mut grammar = self.builder.finalize(root)?;
        grammar.root_rule_id = root.0;
        Ok(grammar)
    }

    /// First pass: register every `name ::=` definition in source order so
    /// that forward references resolve and helper rules sort after all
    /// source rules.
    fn register_rule_names(&mut self) {
        for line in std::str::from_utf8(self.input).unwrap_or("").lines() {
            let trimmed = line.trim_start_matches([' ', '\t']);
            let Some(first) = trimmed.bytes().next() else {
                continue;
            };
            if !(first.is_ascii_alphabetic() || first == b'_') {
                continue;
            }
            let end = trimmed
                .bytes()
                .position(|b| !(b.is_ascii_alphanumeric() || b == b'_'))
                .unwrap_or(trimmed.len());
            let name = &trimmed[..end];
            let rest = trimmed[end..].trim_start_matches([' ', '\t']);
            if rest.starts_with("::=") {
                self.builder.add_rule(name);
            }
        }
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    #[inline]
    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.get(self.pos + offset).copied()
    }

    #[inline]
    fn advance(&mut self) -> Option<u8> {
        let byte = self.input.get(self.pos).copied()?;
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(byte)
    }

    fn error(&self, message: impl Into<String>) -> GrammarError {
        GrammarError::EbnfParse { line: self.line, col: self.col, message: message.into() }
    }

    /// Skips spaces, tabs, carriage returns and `#` comments, but stops at
    /// line feeds.
    fn skip_whitespace_inline(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.advance();
                }
                Some(b'#') => {
                    while let Some(byte) = self.peek() {
                        if byte == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    /// Skips all whitespace including line feeds, plus comments.
    fn skip_whitespace_multiline(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.advance();
                }
                Some(b'#') => {
                    while let Some(byte) = self.peek() {
                        if byte == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn skip_whitespace(&mut self, multiline: bool) {
        if multiline {
            self.skip_whitespace_multiline();
        } else {
            self.skip_whitespace_inline();
        }
    }

    fn is_identifier_start(byte: u8) -> bool {
        byte.is_ascii_alphabetic() || byte == b'_'
    }

    fn parse_identifier(&mut self) -> String {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte.is_ascii_alphanumeric() || byte == b'_' {
                self.advance();
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn parse_rule(&mut self) -> Result<(), GrammarError> {
        match self.peek() {
            Some(byte) if Self::is_identifier_start(byte) => {}
            _ => return Err(self.error("Expect rule name")),
        }
        let name = self.parse_identifier();
        self.skip_whitespace_inline();
        if !self.input[self.pos..].starts_with(b"::=") {
            return Err(self.error("Expect ::="));
        }
        self.advance();
        self.advance();
        self.advance();
        let rule_id = self.builder.add_rule(&name);
        if self.builder.rule_has_body(rule_id) {
            return Err(self.error(format!("Rule \"{}\" is defined multiple times", name)));
        }
        self.cur_rule_name = name.clone();
        self.skip_whitespace_inline();

        self.tag_dispatch_exprs.clear();
        let body = self.parse_choices(false)?;
        if let Some(&dispatch) = self.tag_dispatch_exprs.first() {
            if body != dispatch || self.tag_dispatch_exprs.len() > 1 {
                return Err(self.error("TagDispatch must be the entire rule body"));
            }
            if name != self.root_rule_name {
                return Err(self.error("TagDispatch is only allowed in the root rule"));
            }
            self.builder.set_rule_body(rule_id, dispatch);
        } else {
            let is_choice = matches!(self.builder.expr(body), ExprView::Choice(_));
            let wrapped = if is_choice { body } else { self.builder.choice(&[body]) };
            self.builder.set_rule_body(rule_id, wrapped);
        }

        self.skip_whitespace_inline();
        if self.peek() == Some(b'(') && self.peek_at(1) == Some(b'=') {
            self.advance();
            self.advance();
            let lookahead = self.parse_choices(true)?;
            self.skip_whitespace_multiline();
            if self.peek() != Some(b')') {
                return Err(self.error("Expect ) after lookahead assertion"));
            }
            self.advance();
            self.builder.set_rule_lookahead(rule_id, lookahead);
            self.skip_whitespace_inline();
            if self.peek() == Some(b'(') && self.peek_at(1) == Some(b'=') {
                return Err(self.error("Unexpected lookahead assertion"));
            }
        }
        Ok(())
    }

    fn parse_choices(&mut self, in_parens: bool) -> Result<ExprId, GrammarError> {
        let mut branches = vec![self.parse_sequence(in_parens, true)?];
        loop {
            self.skip_whitespace(in_parens);
            if self.peek() == Some(b'|') {
                self.advance();
                self.skip_whitespace_multiline();
                branches.push(self.parse_sequence(in_parens, false)?);
            } else {
                break;
            }
        }
        if branches.len() == 1 {
            Ok(branches[0])
        } else {
            Ok(self.builder.choice(&branches))
        }
    }

    fn parse_sequence(
        &mut self,
        in_parens: bool,
        is_first_branch: bool,
    ) -> Result<ExprId, GrammarError> {
        let mut elements: Vec<ExprId> = Vec::new();
        loop {
            self.skip_whitespace(in_parens);
            let byte = match self.peek() {
                None => break,
                Some(byte) => byte,
            };
            let stops = byte == b'|'
                || (byte == b')' && in_parens)
                || (byte == b'\n' && !in_parens)
                || (byte == b'(' && self.peek_at(1) == Some(b'=') && !in_parens);
            if stops {
                break;
            }
            let element = match byte {
                b'(' => {
                    self.advance();
                    let inner = self.parse_choices(true)?;
                    self.skip_whitespace_multiline();
                    if self.peek() != Some(b')') {
                        return Err(self.error("Expect )"));
                    }
                    self.advance();
                    inner
                }
                b'"' | b'\'' => self.parse_string_literal()?,
                b'[' => self.parse_char_class()?,
                byte if Self::is_identifier_start(byte) => {
                    let name = self.parse_identifier();
                    if name == "TagDispatch" && self.peek() == Some(b'(') {
                        let dispatch = self.parse_tag_dispatch()?;
                        self.tag_dispatch_exprs.push(dispatch);
                        dispatch
                    } else {
                        match self.builder.rule_id(&name) {
                            Some(rule) => self.builder.rule_ref(rule),
                            None => {
                                return Err(
                                    self.error(format!("Rule \"{}\" is not defined", name))
                                )
                            }
                        }
                    }
                }
                other => {
                    return Err(self.error(format!(
                        "Expect element, but got character: {}",
                        other as char
                    )))
                }
            };
            let element = self.parse_quantifier(element)?;
            elements.push(element);
        }
        if elements.is_empty() {
            if in_parens && is_first_branch && self.peek() == Some(b')') {
                return Ok(self.builder.sequence(&[]));
            }
            return Err(match self.peek() {
                None => self.error("Expect element"),
                Some(byte) => {
                    self.error(format!("Expect element, but got character: {}", byte as char))
                }
            });
        }
        if elements.len() == 1 {
            Ok(elements[0])
        } else {
            Ok(self.builder.sequence(&elements))
        }
    }

    /// Applies an optional quantifier to a freshly parsed element.
    fn parse_quantifier(&mut self, element: ExprId) -> Result<ExprId, GrammarError> {
        let save = (self.pos, self.line, self.col);
        self.skip_whitespace_inline();
        match self.peek() {
            Some(b'*') => {
                self.advance();
                // Fast path: a starred character class stays a single atom.
                let class_parts = match self.builder.expr(element) {
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
                let helper = self.new_helper_rule();
                let recursion = self.builder.rule_ref(helper);
                let empty = self.builder.empty_str();
                let step = self.builder.sequence(&[element, recursion]);
                let body = self.builder.choice(&[empty, step]);
                self.builder.set_rule_body(helper, body);
                Ok(self.builder.rule_ref(helper))
            }
            Some(b'+') => {
                self.advance();
                let helper = self.new_helper_rule();
                let recursion = self.builder.rule_ref(helper);
                let step = self.builder.sequence(&[element, recursion]);
                let body = self.builder.choice(&[step, element]);
                self.builder.set_rule_body(helper, body);
                Ok(self.builder.rule_ref(helper))
            }
            Some(b'?') => {
                self.advance();
                let helper = self.new_helper_rule();
                let empty = self.builder.empty_str();
                let body = self.builder.choice(&[empty, element]);
                self.builder.set_rule_body(helper, body);
                Ok(self.builder.rule_ref(helper))
            }
            Some(b'{') => {
                // Only a brace followed by a digit is a repetition range; any
                // other brace falls through to the element-level error.
                let mut lookahead = self.pos + 1;
                while matches!(self.input.get(lookahead), Some(b' ') | Some(b'\t')) {
                    lookahead += 1;
                }
                if !matches!(self.input.get(lookahead), Some(byte) if byte.is_ascii_digit()) {
                    (self.pos, self.line, self.col) = save;
                    return Ok(element);
                }
                self.advance();
                self.skip_whitespace_inline();
                let min = self.parse_integer()?;
                self.skip_whitespace_inline();
                let max = match self.peek() {
                    Some(b',') => {
                        self.advance();
                        self.skip_whitespace_inline();
                        if self.peek() == Some(b'}') {
                            -1
                        } else {
                            let max = self.parse_integer()?;
                            self.skip_whitespace_inline();
                            max
                        }
                    }
                    _ => min,
                };
                if self.peek() != Some(b'}') {
                    return Err(self.error("Expect } in repetition range"));
                }
                if max >= 0 && max < min {
                    return Err(self.error(
                        "Invalid repetition range: lower bound is larger than upper bound",
                    ));
                }
                self.advance();
                Ok(self.builder.repeat_range(element, min, max))
            }
            _ => {
                (self.pos, self.line, self.col) = save;
                Ok(element)
            }
        }
    }

    fn parse_integer(&mut self) -> Result<i32, GrammarError> {
        let start = self.pos;
        while matches!(self.peek(), Some(byte) if byte.is_ascii_digit()) {
            self.advance();
        }
        if start == self.pos {
            return Err(self.error("Expect integer"));
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|s| s.parse::<i32>().ok())
            .ok_or_else(|| self.error("Repetition count is too large"))
    }

    fn new_helper_rule(&mut self) -> RuleId {
        let name = self.builder.fresh_numbered_name(&self.cur_rule_name.clone());
        self.builder.add_rule(&name)
    }

    fn parse_string_literal(&mut self) -> Result<ExprId, GrammarError> {
        let bytes = self.parse_quoted_bytes()?;
        if bytes.is_empty() {
            Ok(self.builder.empty_str())
        } else {
            Ok(self.builder.byte_string(&bytes))
        }
    }

    /// Parses a quoted string and returns its raw bytes.
    fn parse_quoted_bytes(&mut self) -> Result<Vec<u8>, GrammarError> {
        let quote = self.advance().expect("caller checked the quote");
        let mut bytes: Vec<u8> = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => return Err(self.error("Expect \"")),
                Some(byte) if byte == quote => {
                    self.advance();
                    return Ok(bytes);
                }
                Some(b'\\') => match self.parse_escape(false)? {
                    EscapeValue::Byte(byte) => bytes.push(byte),
                    EscapeValue::Codepoint(cp) => {
                        push_utf8(&mut bytes, cp);
                    }
                },
                Some(byte) => {
                    self.advance();
                    bytes.push(byte);
                }
            }
        }
    }

    /// Parses one escape sequence starting at the backslash. Errors are
    /// reported at the backslash position.
    fn parse_escape(&mut self, in_char_class: bool) -> Result<EscapeValue, GrammarError> {
        let (line, col) = (self.line, self.col);
        self.advance();
        let invalid = || GrammarError::EbnfParse {
            line,
            col,
            message: "Invalid escape sequence".to_string(),
        };
        let byte = self.advance().ok_or_else(invalid)?;
        let codepoint = match byte {
            b'n' => '\n' as u32,
            b't' => '\t' as u32,
            b'r' => '\r' as u32,
            b'0' => 0,
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0C,
            b'v' => 0x0B,
            b'e' => 0x1B,
            b'\\' => '\\' as u32,
            b'"' => '"' as u32,
            b'\'' => '\'' as u32,
            b'?' => '?' as u32,
            b'x' => {
                let value = self.parse_hex_digits(2).ok_or_else(invalid)?;
                return Ok(EscapeValue::Byte(value as u8));
            }
            b'u' => self.parse_hex_digits(4).ok_or_else(invalid)?,
            b'U' => {
                let value = self.parse_hex_digits(8).ok_or_else(invalid)?;
                if value > 0x10FFFF {
                    return Err(invalid());
                }
                value
            }
            b'-' | b']' | b'^' | b'[' if in_char_class => byte as u32,
            _ => return Err(invalid()),
        };
        Ok(EscapeValue::Codepoint(codepoint))
    }

    fn parse_hex_digits(&mut self, count: usize) -> Option<u32> {
        let mut value: u32 = 0;
        for _ in 0..count {
            let byte = self.peek()?;
            let digit = (byte as char).to_digit(16)?;
            self.advance();
            value = value.wrapping_shl(4) | digit;
        }
        Some(value)
    }

    /// Decodes one codepoint for a character class: an escape or a literal
    /// (possibly multi-byte) character.
    fn parse_class_codepoint(&mut self) -> Result<u32, GrammarError> {
        if self.peek() == Some(b'\\') {
            return match self.parse_escape(true)? {
                EscapeValue::Byte(byte) => Ok(byte as u32),
                EscapeValue::Codepoint(cp) => Ok(cp),
            };
        }
        let first = self.advance().expect("caller checked non-empty");
        let (len, init) = match crate::utils::utf8_leading_byte(first) {
            Some(v) => v,
            None => return Err(self.error("Invalid UTF-8 in character class")),
        };
        let mut codepoint = init;
        for _ in 1..len {
            let cont = self.advance().ok_or_else(|| self.error("Invalid UTF-8 in character class"))?;
            if !crate::utils::is_utf8_continuation(cont) {
                return Err(self.error("Invalid UTF-8 in character class"));
            }
            codepoint = (codepoint << 6) | (cont & 0x3F) as u32;
        }
        Ok(codepoint)
    }

    fn parse_char_class(&mut self) -> Result<ExprId, GrammarError> {
        self.advance(); // consume '['
        let negated = if self.peek() == Some(b'^') {
            self.advance();
            true
        } else {
            false
        };
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("Expect ] in character class")),
                Some(b'\n') => {
                    return Err(self.error("Character class should not contain newline"))
                }
                Some(b']') => {
                    self.advance();
                    break;
                }
                Some(_) => {
                    let lo = self.parse_class_codepoint()?;
                    if self.peek() == Some(b'-') && self.peek_at(1) != Some(b']') {
                        self.advance();
                        if self.peek() == Some(b'\n') {
                            return Err(
                                self.error("Character class should not contain newline")
                            );
                        }
                        let hi = self.parse_class_codepoint()?;
                        if lo > hi {
                            return Err(self.error(
                                "Invalid character class: lower bound is larger than upper bound",
                            ));
                        }
                        ranges.push((lo, hi));
                    } else {
                        ranges.push((lo, lo));
                    }
                }
            }
        }
        Ok(self.builder.char_class(negated, &ranges))
    }

    fn parse_tag_dispatch(&mut self) -> Result<ExprId, GrammarError> {
        self.advance(); // consume '('
        let mut pairs: Vec<(ExprId, RuleId)> = Vec::new();
        let mut trigger_strings: Vec<Vec<u8>> = Vec::new();
        let mut stop_eos = true;
        let mut stop_strs: Vec<ExprId> = Vec::new();
        let mut loop_after_dispatch = true;
        let mut excludes: Vec<ExprId> = Vec::new();
        loop {
            self.skip_whitespace_multiline();
            match self.peek() {
                None => return Err(self.error("Expect ) in TagDispatch")),
                Some(b')') => {
                    self.advance();
                    break;
                }
                Some(b'(') => {
                    self.advance();
                    self.skip_whitespace_multiline();
                    if !matches!(self.peek(), Some(b'"') | Some(b'\'')) {
                        return Err(self.error("Expect trigger string in TagDispatch"));
                    }
                    let trigger = self.parse_quoted_bytes()?;
                    if trigger.is_empty() {
                        return Err(self.error("Tag dispatch trigger must not be empty"));
                    }
                    if trigger_strings.contains(&trigger) {
                        return Err(self.error("Tag dispatch triggers must be distinct"));
                    }
                    self.skip_whitespace_multiline();
                    if self.peek() != Some(b',') {
                        return Err(self.error("Expect , in TagDispatch pair"));
                    }
                    self.advance();
                    self.skip_whitespace_multiline();
                    if !matches!(self.peek(), Some(byte) if Self::is_identifier_start(byte)) {
                        return Err(self.error("Expect rule name in TagDispatch pair"));
                    }
                    let name = self.parse_identifier();
                    let rule = match self.builder.rule_id(&name) {
                        Some(rule) => rule,
                        None => {
                            return Err(self.error(format!("Rule \"{}\" is not defined", name)))
                        }
                    };
                    if name == self.root_rule_name {
                        return Err(self.error("Tag dispatch target cannot be the root rule"));
                    }
                    self.skip_whitespace_multiline();
                    if self.peek() != Some(b')') {
                        return Err(self.error("Expect ) in TagDispatch pair"));
                    }
                    self.advance();
                    let trigger_expr = self.builder.byte_string(&trigger);
                    trigger_strings.push(trigger);
                    pairs.push((trigger_expr, rule));
                }
                Some(byte) if Self::is_identifier_start(byte) => {
                    let option = self.parse_identifier();
                    self.skip_whitespace_multiline();
                    if self.peek() != Some(b'=') {
                        return Err(self.error("Expect = after TagDispatch option"));
                    }
                    self.advance();
                    self.skip_whitespace_multiline();
                    match option.as_str() {
                        "stop_eos" => stop_eos = self.parse_boolean()?,
                        "loop_after_dispatch" => loop_after_dispatch = self.parse_boolean()?,
                        "stop_str" => {
                            for bytes in self.parse_string_tuple()? {
                                let expr = self.builder.byte_string(&bytes);
                                stop_strs.push(expr);
                            }
                        }
                        "excludes" => {
                            for bytes in self.parse_string_tuple()? {
                                let expr = self.builder.byte_string(&bytes);
                                excludes.push(expr);
                            }
                        }
                        other => {
                            return Err(
                                self.error(format!("Unknown TagDispatch option: {}", other))
                            )
                        }
                    }
                }
                Some(other) => {
                    return Err(self.error(format!(
                        "Expect ( or option in TagDispatch, but got character: {}",
                        other as char
                    )))
                }
            }
            self.skip_whitespace_multiline();
            match self.peek() {
                Some(b',') => {
                    self.advance();
                }
                Some(b')') => {}
                _ => return Err(self.error("Expect , or ) in TagDispatch")),
            }
        }
        Ok(self.builder.tag_dispatch(&TagDispatchSpec {
            pairs,
            stop_eos,
            stop_strs,
            loop_after_dispatch,
            excludes,
        }))
    }

    fn parse_boolean(&mut self) -> Result<bool, GrammarError> {
        if self.input[self.pos..].starts_with(b"true") {
            for _ in 0..4 {
                self.advance();
            }
            Ok(true)
        } else if self.input[self.pos..].starts_with(b"false") {
            for _ in 0..5 {
                self.advance();
            }
            Ok(false)
        } else {
            Err(self.error("Expect true or false"))
        }
    }

    fn parse_string_tuple(&mut self) -> Result<Vec<Vec<u8>>, GrammarError> {
        if self.peek() != Some(b'(') {
            return Err(self.error("Expect ( in TagDispatch option"));
        }
        self.advance();
        let mut strings = Vec::new();
        loop {
            self.skip_whitespace_multiline();
            match self.peek() {
                Some(b')') => {
                    self.advance();
                    break;
                }
                Some(b'"') | Some(b'\'') => {
                    strings.push(self.parse_quoted_bytes()?);
                    self.skip_whitespace_multiline();
                    if self.peek() == Some(b',') {
                        self.advance();
                    }
                }
                _ => return Err(self.error("Expect string in TagDispatch option")),
            }
        }
        Ok(strings)
    }
}

fn push_utf8(bytes: &mut Vec<u8>, codepoint: u32) {
    match char::from_u32(codepoint) {
        Some(ch) => {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
        }
        None => {
            // Unpaired surrogates cannot be encoded; keep the replacement
            // character so the grammar still parses deterministically.
            bytes.extend_from_slice("\u{FFFD}".as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_rule() {
        let grammar = parse_ebnf("root ::= \"ab\"\n", "root").unwrap();
        assert_eq!(grammar.to_string(), "root ::= (\"ab\")\n");
    }

    #[test]
    fn test_forward_reference() {
        let grammar = parse_ebnf("root ::= b\nb ::= \"b\"\n", "root").unwrap();
        assert_eq!(grammar.to_string(), "root ::= (b)\nb ::= (\"b\")\n");
    }

    #[test]
    fn test_undefined_rule() {
        let err = parse_ebnf("root ::= a b", "root").unwrap_err();
        assert_eq!(
            err.to_string(),
            "EBNF parse error at line 1, column 11: Rule \"a\" is not defined"
        );
    }

    #[test]
    fn test_duplicate_rule() {
        let err = parse_ebnf("root ::= \"a\"\nroot ::= \"b\"", "root").unwrap_err();
        assert_eq!(
            err.to_string(),
            "EBNF parse error at line 2, column 9: Rule \"root\" is defined multiple times"
        );
    }

    #[test]
    fn test_missing_root() {
        let err = parse_ebnf("a ::= \"a\"", "root").unwrap_err();
        assert_eq!(
            err.to_string(),
            "EBNF parse error at line 1, column 10: The root rule with name \"root\" is not found."
        );
    }

    #[test]
    fn test_quantifier_lowering() {
        let grammar = parse_ebnf("root ::= \"ab\"*\n", "root").unwrap();
        assert_eq!(
            grammar.to_string(),
            "root ::= (root_1)\nroot_1 ::= (\"\" | (\"ab\" root_1))\n"
        );
    }

    #[test]
    fn test_class_star_fast_path() {
        let grammar = parse_ebnf("root ::= [ab]* \"c\"\n", "root").unwrap();
        assert_eq!(grammar.to_string(), "root ::= (([ab]* \"c\"))\n");
    }

    #[test]
    fn test_consecutive_quantifiers() {
        let err = parse_ebnf("root ::= \"a\"{1,3}{1,3}\n", "root").unwrap_err();
        assert_eq!(
            err.to_string(),
            "EBNF parse error at line 1, column 18: Expect element, but got character: {"
        );
        let err = parse_ebnf("root ::= \"a\"++\n", "root").unwrap_err();
        assert_eq!(
            err.to_string(),
            "EBNF parse error at line 1, column 14: Expect element, but got character: +"
        );
    }

    #[test]
    fn test_newline_in_char_class() {
        let err = parse_ebnf("root ::= [a\n]", "root").unwrap_err();
        assert_eq!(
            err.to_string(),
            "EBNF parse error at line 1, column 12: Character class should not contain newline"
        );
    }

    #[test]
    fn test_invalid_escape() {
        let err = parse_ebnf(r#"root ::= "\@""#, "root").unwrap_err();
        assert_eq!(
            err.to_string(),
            "EBNF parse error at line 1, column 11: Invalid escape sequence"
        );
        let err = parse_ebnf(r#"root ::= "\uFF""#, "root").unwrap_err();
        assert_eq!(
            err.to_string(),
            "EBNF parse error at line 1, column 11: Invalid escape sequence"
        );
    }

    #[test]
    fn test_reversed_char_class() {
        let err = parse_ebnf(r"root ::= [Z-A]", "root").unwrap_err();
        assert_eq!(
            err.to_string(),
            "EBNF parse error at line 1, column 14: Invalid character class: \
             lower bound is larger than upper bound"
        );
    }

    #[test]
    fn test_tag_dispatch_errors() {
        assert!(parse_ebnf("root ::= TagDispatch((\"\", rule1))\nrule1 ::= \"a\"\n", "root").is_err());
        assert!(parse_ebnf("root ::= TagDispatch((\"tag1\", undefined_rule))\n", "root").is_err());
        assert!(parse_ebnf("root ::= TagDispatch((\"tag1\", root))\n", "root").is_err());
        assert!(parse_ebnf("root ::= TagDispatch(\"tag1\", rule1)\nrule1 ::= \"a\"\n", "root").is_err());
        assert!(parse_ebnf(
            "root ::= rule1\nrule1 ::= TagDispatch((\"tag1\", rule2))\nrule2 ::= \"a\"\n",
            "root"
        )
        .is_err());
    }
}
