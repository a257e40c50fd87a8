//! The grammar matcher: a non-deterministic pushdown automaton with bounded
//! backtracking.
//!
//! The matcher keeps an explicit vector of live stack configurations (no
//! call-stack continuations). Accepting a token feeds its decoded bytes
//! through every configuration; filling the next-token bitmask combines the
//! compiler's per-position adaptive masks and verifies the uncertain
//! remainder by speculatively advancing the automaton and rolling back.
//!
//! All operations on one matcher run on a single thread and complete
//! synchronously; a process may host many matchers in parallel, all sharing
//! one immutable [`CompiledGrammar`].
use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashSet;
use displaydoc::Display;
use fixedbitset_stack::FixedBitSet;
use tinyvec::TinyVec;

use crate::bitmask::TokenBitmask;
use crate::compiler::{CompiledGrammar, MaskStoreType, PositionKey};
use crate::grammar::{ExprId, ExprView, FsmTerminal, Grammar, TagDispatchSpec};
use crate::utils::{self, ByteSet};

/// Upper bound on the stack depth of one configuration. Configurations that
/// exceed it (pathologically left-recursive grammars) are dropped.
const MAX_STACK_DEPTH: usize = 10_000;

/// Upper bound on the length of a jump-forward string.
const MAX_JUMP_FORWARD_BYTES: usize = 4096;

/// One frame of a configuration stack.
///
/// For sequence frames, `expr_id` is a `Sequence` expression (one branch of
/// a rule body), `element` is the index of the current atom and `sub_pos`
/// the byte offset inside a `ByteString` atom. For tag-dispatch frames,
/// `expr_id` is the `TagDispatch` expression and `element` is the scanning
/// automaton state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub(crate) struct StackFrame {
    pub expr_id: i32,
    pub element: u32,
    pub sub_pos: u32,
    /// In-progress UTF-8 decode for character-class atoms:
    /// `remaining << 24 | accumulated_bits`, or 0 when idle.
    pub utf8_state: u32,
}

impl StackFrame {
    pub(crate) fn new(expr_id: i32, element: u32, sub_pos: u32) -> StackFrame {
        StackFrame { expr_id, element, sub_pos, utf8_state: 0 }
    }
}

pub(crate) type Stack = TinyVec<[StackFrame; 8]>;

/// The result of feeding one token's bytes through a configuration set at
/// compile time.
pub(crate) struct SimulationOutcome {
    /// A configuration survived inside the simulated subtree (or completed
    /// it exactly at the last byte).
    pub survived: bool,
    /// Byte counts that remained when some configuration popped out of the
    /// simulated subtree.
    pub popped_remaining: Vec<usize>,
}

/// Byte-level transition engine over a normalized grammar. Shared by the
/// runtime matcher and the compile-time mask builder.
pub(crate) struct Pda<'a> {
    pub grammar: &'a Grammar,
}

impl<'a> Pda<'a> {
    pub(crate) fn new(grammar: &'a Grammar) -> Pda<'a> {
        Pda { grammar }
    }

    /// The initial configuration set of the grammar.
    pub(crate) fn initial_configs(&self) -> Vec<Stack> {
        let root = self.grammar.root_rule_id();
        let body = ExprId(self.grammar.rule(root).body_expr_id());
        let mut configs = Vec::new();
        match self.grammar.expr(body) {
            ExprView::TagDispatch(_) => {
                let mut stack = Stack::new();
                stack.push(StackFrame::new(body.0, 0, 0));
                self.close_one(stack, &mut configs);
            }
            _ => {
                for branch in self.body_branches(body) {
                    let mut stack = Stack::new();
                    match self.grammar.expr(branch) {
                        ExprView::EmptyStr => {}
                        _ => stack.push(StackFrame::new(branch.0, 0, 0)),
                    }
                    self.close_one(stack, &mut configs);
                }
            }
        }
        dedup_configs(configs)
    }

    fn body_branches(&self, body: ExprId) -> Vec<ExprId> {
        match self.grammar.expr(body) {
            ExprView::Choice(children) => children.iter().map(|&c| ExprId(c)).collect(),
            _ => vec![body],
        }
    }

    fn is_dispatch_expr(&self, expr_id: i32) -> bool {
        matches!(self.grammar.expr(ExprId(expr_id)), ExprView::TagDispatch(_))
    }

    /// Pops the completed top frame and advances the parent. Returns false
    /// when the configuration should be dropped.
    fn complete_top(&self, stack: &mut Stack) {
        stack.pop();
        if let Some(parent) = stack.last_mut() {
            if self.is_dispatch_expr(parent.expr_id) {
                // A dispatched rule finished: loop back to scanning or end
                // the dispatch section.
                let spec = self.dispatch_spec(parent.expr_id);
                if spec.loop_after_dispatch {
                    parent.element = 0;
                } else {
                    self.complete_top(stack);
                }
            } else {
                parent.element += 1;
                parent.sub_pos = 0;
                parent.utf8_state = 0;
            }
        }
    }

    fn dispatch_spec(&self, expr_id: i32) -> TagDispatchSpec {
        match self.grammar.expr(ExprId(expr_id)) {
            ExprView::TagDispatch(payload) => TagDispatchSpec::decode(payload),
            _ => unreachable!("dispatch frame must point at a TagDispatch expression"),
        }
    }

    /// Expands one configuration until every resulting configuration rests
    /// on a consuming atom (byte string, character class or dispatch scan)
    /// or has an empty stack (accepting).
    pub(crate) fn close_one(&self, stack: Stack, out: &mut Vec<Stack>) {
        let mut work = vec![stack];
        while let Some(mut stack) = work.pop() {
            loop {
                let Some(top) = stack.last().copied() else {
                    out.push(stack);
                    break;
                };
                if self.is_dispatch_expr(top.expr_id) {
                    out.push(stack);
                    break;
                }
                let children: Vec<i32> = match self.grammar.expr(ExprId(top.expr_id)) {
                    ExprView::Sequence(children) => children.to_vec(),
                    _ => unreachable!("stack frames point at sequences or dispatches"),
                };
                if top.element as usize >= children.len() {
                    self.complete_top(&mut stack);
                    continue;
                }
                let atom = ExprId(children[top.element as usize]);
                match self.grammar.expr(atom) {
                    ExprView::ByteString(bytes) if bytes.is_empty() => {
                        advance_element(&mut stack);
                        continue;
                    }
                    ExprView::ByteString(_) | ExprView::CharClass { .. } => {
                        out.push(stack);
                        break;
                    }
                    ExprView::EmptyStr => {
                        advance_element(&mut stack);
                        continue;
                    }
                    ExprView::CharClassStar { .. } => {
                        // Zero-or-more: fork a configuration that skips the
                        // star entirely.
                        let mut skipped = stack.clone();
                        advance_element(&mut skipped);
                        work.push(skipped);
                        out.push(stack);
                        break;
                    }
                    ExprView::RuleRef(rule) => {
                        if stack.len() >= MAX_STACK_DEPTH {
                            log::warn!(
                                "Dropping a configuration that exceeded the maximum stack depth; \
                                 the grammar is likely left-recursive."
                            );
                            break;
                        }
                        let body =
                            ExprId(self.grammar.rule(crate::grammar::RuleId(rule)).body_expr_id());
                        if self.is_dispatch_expr(body.0) {
                            stack.push(StackFrame::new(body.0, 0, 0));
                            continue;
                        }
                        for branch in self.body_branches(body) {
                            match self.grammar.expr(branch) {
                                ExprView::EmptyStr => {
                                    let mut skipped = stack.clone();
                                    advance_element(&mut skipped);
                                    work.push(skipped);
                                }
                                _ => {
                                    let mut entered = stack.clone();
                                    entered.push(StackFrame::new(branch.0, 0, 0));
                                    work.push(entered);
                                }
                            }
                        }
                        break;
                    }
                    ExprView::Choice(_)
                    | ExprView::TagDispatch(_)
                    | ExprView::RepeatRange { .. }
                    | ExprView::Sequence(_) => {
                        unreachable!("non-atomic expression in a normalized sequence")
                    }
                }
            }
        }
    }

    /// Advances every configuration by one byte. Configurations that cannot
    /// consume the byte die. In simulation mode, configurations whose stack
    /// is already empty are recorded through `popped_out` instead of dying
    /// silently.
    pub(crate) fn advance_byte(
        &self,
        configs: &[Stack],
        byte: u8,
        mut popped_out: Option<&mut bool>,
    ) -> Vec<Stack> {
        let mut next: Vec<Stack> = Vec::with_capacity(configs.len());
        for config in configs {
            let Some(top) = config.last().copied() else {
                if let Some(flag) = popped_out.as_deref_mut() {
                    *flag = true;
                }
                continue;
            };
            if self.is_dispatch_expr(top.expr_id) {
                self.advance_dispatch(config, top, byte, &mut next);
                continue;
            }
            let children: Vec<i32> = match self.grammar.expr(ExprId(top.expr_id)) {
                ExprView::Sequence(children) => children.to_vec(),
                _ => continue,
            };
            let atom = ExprId(children[top.element as usize]);
            match self.grammar.expr(atom) {
                ExprView::ByteString(bytes) => {
                    if bytes[top.sub_pos as usize] as u8 == byte {
                        let mut advanced = config.clone();
                        let done = {
                            let frame = advanced.last_mut().expect("non-empty stack");
                            frame.sub_pos += 1;
                            frame.sub_pos as usize == bytes.len()
                        };
                        if done {
                            advance_element(&mut advanced);
                        }
                        self.close_one(advanced, &mut next);
                    }
                }
                ExprView::CharClass { negated, ranges } => {
                    if let Some(matched) = step_char_class(top.utf8_state, byte, negated, ranges) {
                        let mut advanced = config.clone();
                        match matched {
                            CharStep::Complete => {
                                advance_element(&mut advanced);
                                self.close_one(advanced, &mut next);
                            }
                            CharStep::Partial(state) => {
                                advanced.last_mut().expect("non-empty stack").utf8_state = state;
                                next.push(advanced);
                            }
                        }
                    }
                }
                ExprView::CharClassStar { negated, ranges } => {
                    if let Some(matched) = step_char_class(top.utf8_state, byte, negated, ranges) {
                        let mut advanced = config.clone();
                        match matched {
                            CharStep::Complete => {
                                // The star stays at its element; the skip
                                // fork was produced by the closure.
                                advanced.last_mut().expect("non-empty stack").utf8_state = 0;
                                self.close_one(advanced, &mut next);
                            }
                            CharStep::Partial(state) => {
                                advanced.last_mut().expect("non-empty stack").utf8_state = state;
                                next.push(advanced);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        dedup_configs(next)
    }

    fn advance_dispatch(&self, config: &Stack, top: StackFrame, byte: u8, next: &mut Vec<Stack>) {
        let fsm = self.grammar.fsm(ExprId(top.expr_id));
        let state = fsm.step(top.element, byte);
        match fsm.terminal(state) {
            FsmTerminal::Exclude(_) => {}
            FsmTerminal::Stop(_) => {
                // The stop string is consumed and the dispatch section ends.
                let mut advanced = config.clone();
                advanced.pop();
                if advanced.last().is_some() {
                    let parent = advanced.last_mut().expect("checked non-empty");
                    if self.is_dispatch_expr(parent.expr_id) {
                        let spec = self.dispatch_spec(parent.expr_id);
                        if spec.loop_after_dispatch {
                            parent.element = 0;
                        } else {
                            self.complete_top(&mut advanced);
                        }
                    } else {
                        parent.element += 1;
                        parent.sub_pos = 0;
                        parent.utf8_state = 0;
                    }
                }
                self.close_one(advanced, next);
            }
            FsmTerminal::Trigger(pair_index) => {
                let spec = self.dispatch_spec(top.expr_id);
                let (_, rule) = spec.pairs[pair_index as usize];
                let body = ExprId(self.grammar.rule(rule).body_expr_id());
                let mut rescan = config.clone();
                rescan.last_mut().expect("non-empty stack").element = 0;
                if self.is_dispatch_expr(body.0) {
                    let mut entered = rescan.clone();
                    entered.push(StackFrame::new(body.0, 0, 0));
                    self.close_one(entered, next);
                } else {
                    for branch in self.body_branches(body) {
                        match self.grammar.expr(branch) {
                            ExprView::EmptyStr => {
                                // The dispatched rule matches nothing; keep
                                // scanning.
                                self.close_one(rescan.clone(), next);
                            }
                            _ => {
                                let mut entered = rescan.clone();
                                entered.push(StackFrame::new(branch.0, 0, 0));
                                self.close_one(entered, next);
                            }
                        }
                    }
                }
            }
            FsmTerminal::None => {
                let mut advanced = config.clone();
                advanced.last_mut().expect("non-empty stack").element = state;
                next.push(advanced);
            }
        }
    }

    /// Whether a configuration is at an accepting position of the root rule.
    pub(crate) fn is_accepting(&self, config: &Stack) -> bool {
        match config.len() {
            0 => true,
            1 => {
                let top = config[0];
                if !self.is_dispatch_expr(top.expr_id) {
                    return false;
                }
                self.dispatch_spec(top.expr_id).stop_eos
            }
            _ => false,
        }
    }

    /// Collects the bytes that could be consumed next by a configuration.
    pub(crate) fn possible_next_bytes(&self, config: &Stack, out: &mut ByteSet) {
        let Some(top) = config.last().copied() else {
            return;
        };
        if self.is_dispatch_expr(top.expr_id) {
            let fsm = self.grammar.fsm(ExprId(top.expr_id));
            for byte in 0..=u8::MAX {
                let state = fsm.step(top.element, byte);
                if !matches!(fsm.terminal(state), FsmTerminal::Exclude(_)) {
                    out.insert(byte as usize);
                }
            }
            return;
        }
        let children: Vec<i32> = match self.grammar.expr(ExprId(top.expr_id)) {
            ExprView::Sequence(children) => children.to_vec(),
            _ => return,
        };
        let atom = ExprId(children[top.element as usize]);
        match self.grammar.expr(atom) {
            ExprView::ByteString(bytes) => {
                out.insert(bytes[top.sub_pos as usize] as u8 as usize);
            }
            ExprView::CharClass { negated, ranges }
            | ExprView::CharClassStar { negated, ranges } => {
                if top.utf8_state != 0 {
                    // Mid-codepoint: any continuation byte may be valid.
                    for byte in 0x80..=0xBFu8 {
                        out.insert(byte as usize);
                    }
                } else {
                    class_leading_bytes(negated, ranges, out);
                }
            }
            _ => {}
        }
    }

    /// Feeds a token's bytes through a configuration set at compile time.
    pub(crate) fn simulate_token(&self, start: &[Stack], bytes: &[u8]) -> SimulationOutcome {
        let mut configs: Vec<Stack> = start.to_vec();
        let mut popped_remaining = Vec::new();
        for (index, &byte) in bytes.iter().enumerate() {
            let mut popped = false;
            configs = self.advance_byte(&configs, byte, Some(&mut popped));
            if popped {
                popped_remaining.push(bytes.len() - index);
            }
            if configs.is_empty() {
                break;
            }
        }
        SimulationOutcome { survived: !configs.is_empty(), popped_remaining }
    }
}

fn advance_element(stack: &mut Stack) {
    let frame = stack.last_mut().expect("non-empty stack");
    frame.element += 1;
    frame.sub_pos = 0;
    frame.utf8_state = 0;
}

pub(crate) fn dedup_configs(configs: Vec<Stack>) -> Vec<Stack> {
    if configs.len() <= 1 {
        return configs;
    }
    let mut seen: AHashSet<Stack> = AHashSet::with_capacity(configs.len());
    let mut result = Vec::with_capacity(configs.len());
    for config in configs {
        if seen.insert(config.clone()) {
            result.push(config);
        }
    }
    result
}

enum CharStep {
    Complete,
    Partial(u32),
}

/// Advances the incremental UTF-8 decode of a character-class atom by one
/// byte. Returns `None` when the byte cannot continue a codepoint accepted
/// by the class.
fn step_char_class(utf8_state: u32, byte: u8, negated: bool, ranges: &[i32]) -> Option<CharStep> {
    let in_class = |cp: u32| utils::ranges_contain(ranges, cp) != negated;
    if utf8_state == 0 {
        let (len, init) = utils::utf8_leading_byte(byte)?;
        if len == 1 {
            return in_class(init).then_some(CharStep::Complete);
        }
        return Some(CharStep::Partial((len - 1) << 24 | init));
    }
    if !utils::is_utf8_continuation(byte) {
        return None;
    }
    let remaining = utf8_state >> 24;
    let accum = (utf8_state & 0x00FF_FFFF) << 6 | (byte & 0x3F) as u32;
    if remaining == 1 {
        return (accum <= 0x10FFFF && in_class(accum)).then_some(CharStep::Complete);
    }
    Some(CharStep::Partial((remaining - 1) << 24 | accum))
}

/// Inserts the possible leading bytes of the class's codepoints.
fn class_leading_bytes(negated: bool, ranges: &[i32], out: &mut ByteSet) {
    if negated {
        // Sound superset: any valid UTF-8 leading byte.
        for byte in 0x00..=0x7Fu8 {
            out.insert(byte as usize);
        }
        for byte in 0xC2..=0xF4u8 {
            out.insert(byte as usize);
        }
        return;
    }
    const SPANS: [(u32, u32); 4] = [(0x00, 0x7F), (0x80, 0x7FF), (0x800, 0xFFFF), (0x10000, 0x10FFFF)];
    for pair in ranges.chunks_exact(2) {
        let (lo, hi) = (pair[0] as u32, pair[1] as u32);
        for &(span_lo, span_hi) in &SPANS {
            let lo = lo.max(span_lo);
            let hi = hi.min(span_hi);
            if lo > hi {
                continue;
            }
            let first = leading_byte(lo);
            let last = leading_byte(hi);
            for byte in first..=last {
                out.insert(byte as usize);
            }
        }
    }
}

fn leading_byte(codepoint: u32) -> u8 {
    match codepoint {
        0x00..=0x7F => codepoint as u8,
        0x80..=0x7FF => 0xC0 | (codepoint >> 6) as u8,
        0x800..=0xFFFF => 0xE0 | (codepoint >> 12) as u8,
        _ => 0xF0 | (codepoint >> 18) as u8,
    }
}

/// Computes the cache position of a configuration's top frame, or `None`
/// for states the cache does not cover (mid-codepoint decodes).
pub(crate) fn position_of(config: &Stack) -> Option<PositionKey> {
    let top = config.last()?;
    if top.utf8_state != 0 {
        return None;
    }
    Some(PositionKey { expr: top.expr_id, element: top.element, sub: top.sub_pos })
}

/// Represents the error when a [`GrammarMatcher`] operation is misused.
/// The matcher state is unchanged when one of these is returned.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatcherError {
    /// The token id {0} is outside the vocabulary of size {1}.
    TokenIdOutOfRange(u32, usize),
    /// The rollback of {0} tokens exceeds the available history of {1}.
    RollbackOutOfRange(usize, usize),
    /// The bitmask vocabulary size does not match the matcher's.
    BitmaskShapeMismatch,
    /// The batch index {0} is out of range for the bitmask.
    BatchIndexOutOfRange(usize),
}

/// Options for creating a [`GrammarMatcher`].
#[derive(Debug, Clone, Default)]
pub struct MatcherOptions {
    /// Replaces the tokenizer's stop token ids when set.
    pub override_stop_tokens: Option<Vec<i32>>,
    /// Terminate once the grammar is fully matched, without requiring a stop
    /// token.
    pub terminate_without_stop_token: bool,
    /// How many accepted tokens can be rolled back.
    pub max_rollback_tokens: usize,
}

#[derive(Debug, Clone)]
struct Snapshot {
    configs: Vec<Stack>,
    terminated: bool,
}

/// Matches committed tokens against a compiled grammar and produces the
/// bitmask of admissible next tokens.
///
/// A matcher owns mutable state and is used by one generation stream; the
/// underlying [`CompiledGrammar`] may be shared freely.
#[derive(Debug, Clone)]
pub struct GrammarMatcher {
    compiled: Arc<CompiledGrammar>,
    configs: Vec<Stack>,
    history: VecDeque<Snapshot>,
    terminated: bool,
    stop_token_ids: Vec<i32>,
    terminate_without_stop_token: bool,
    max_rollback_tokens: usize,
}

impl GrammarMatcher {
    /// Creates a matcher at the grammar's initial state.
    pub fn new(compiled: Arc<CompiledGrammar>, options: &MatcherOptions) -> GrammarMatcher {
        let stop_token_ids = options
            .override_stop_tokens
            .clone()
            .unwrap_or_else(|| compiled.tokenizer_info().stop_token_ids().to_vec());
        let pda = Pda::new(compiled.grammar());
        let configs = pda.initial_configs();
        GrammarMatcher {
            compiled,
            configs,
            history: VecDeque::new(),
            terminated: false,
            stop_token_ids,
            terminate_without_stop_token: options.terminate_without_stop_token,
            max_rollback_tokens: options.max_rollback_tokens,
        }
    }

    /// The stop token ids in effect for this matcher.
    pub fn stop_token_ids(&self) -> &[i32] {
        &self.stop_token_ids
    }

    /// The maximum number of tokens that can be rolled back.
    pub fn max_rollback_tokens(&self) -> usize {
        self.max_rollback_tokens
    }

    fn pda(&self) -> Pda<'_> {
        Pda::new(self.compiled.grammar())
    }

    fn push_history(&mut self, previous_configs: Vec<Stack>, previous_terminated: bool) {
        if self.max_rollback_tokens == 0 {
            return;
        }
        if self.history.len() == self.max_rollback_tokens {
            self.history.pop_front();
        }
        self.history.push_back(Snapshot {
            configs: previous_configs,
            terminated: previous_terminated,
        });
    }

    fn has_accepting_config(&self) -> bool {
        let pda = self.pda();
        self.configs.iter().any(|c| pda.is_accepting(c))
    }

    /// Accepts one committed token and advances the matcher state.
    ///
    /// Returns `Ok(false)` and leaves the state unchanged when the token is
    /// not admissible.
    ///
    /// # Errors
    ///
    /// Returns [`MatcherError::TokenIdOutOfRange`] when the token id is not
    /// within the vocabulary.
    pub fn accept_token(&mut self, token_id: u32) -> Result<bool, MatcherError> {
        let info = self.compiled.tokenizer_info();
        let vocab_size = info.vocab_size();
        if token_id as usize >= vocab_size {
            return Err(MatcherError::TokenIdOutOfRange(token_id, vocab_size));
        }
        if self.terminated {
            return Ok(false);
        }
        if self.stop_token_ids.contains(&(token_id as i32)) {
            if !self.has_accepting_config() {
                return Ok(false);
            }
            let previous = self.configs.clone();
            let previous_terminated = self.terminated;
            self.push_history(previous, previous_terminated);
            self.terminated = true;
            return Ok(true);
        }
        if info.is_special_token_id(token_id) {
            return Ok(false);
        }
        let bytes = info.token_bytes(token_id).unwrap_or(&[]).to_vec();
        self.advance_bytes_committed(&bytes)
    }

    /// Accepts a raw byte string as if it were a single token. Debug-level
    /// entry point complementing [`GrammarMatcher::accept_token`]; the whole
    /// string counts as one rollback step.
    pub fn accept_string(&mut self, bytes: &[u8]) -> Result<bool, MatcherError> {
        if self.terminated {
            return Ok(false);
        }
        self.advance_bytes_committed(bytes)
    }

    fn advance_bytes_committed(&mut self, bytes: &[u8]) -> Result<bool, MatcherError> {
        let pda = self.pda();
        let mut configs = self.configs.clone();
        for &byte in bytes {
            configs = pda.advance_byte(&configs, byte, None);
            if configs.is_empty() {
                return Ok(false);
            }
        }
        let previous = std::mem::replace(&mut self.configs, configs);
        let previous_terminated = self.terminated;
        self.push_history(previous, previous_terminated);
        Ok(true)
    }

    /// Whether the matcher has terminated: a stop token was accepted, or
    /// `terminate_without_stop_token` is set and the grammar is fully
    /// matched.
    pub fn is_terminated(&self) -> bool {
        if self.terminated {
            return true;
        }
        self.terminate_without_stop_token && self.has_accepting_config()
    }

    /// Restores the state from `num_tokens` accepted tokens ago.
    ///
    /// # Errors
    ///
    /// Returns [`MatcherError::RollbackOutOfRange`] when `num_tokens`
    /// exceeds the recorded history or the configured maximum.
    pub fn rollback(&mut self, num_tokens: usize) -> Result<(), MatcherError> {
        if num_tokens == 0 {
            return Ok(());
        }
        if num_tokens > self.history.len() {
            return Err(MatcherError::RollbackOutOfRange(num_tokens, self.history.len()));
        }
        for _ in 0..num_tokens - 1 {
            self.history.pop_back();
        }
        let snapshot = self.history.pop_back().expect("length checked above");
        self.configs = snapshot.configs;
        self.terminated = snapshot.terminated;
        Ok(())
    }

    /// Resets the matcher to the initial state.
    pub fn reset(&mut self) {
        self.configs = self.pda().initial_configs();
        self.history.clear();
        self.terminated = false;
    }

    /// Fills row `index` of the bitmask with the admissible next tokens.
    ///
    /// # Errors
    ///
    /// Returns a [`MatcherError`] when the bitmask shape or batch index does
    /// not match; the bitmask is unchanged in that case.
    pub fn fill_next_token_bitmask(
        &self,
        bitmask: &mut TokenBitmask,
        index: usize,
    ) -> Result<(), MatcherError> {
        let info = self.compiled.tokenizer_info();
        let vocab_size = info.vocab_size();
        if bitmask.vocab_size() != vocab_size {
            return Err(MatcherError::BitmaskShapeMismatch);
        }
        if index >= bitmask.shape().0 {
            return Err(MatcherError::BatchIndexOutOfRange(index));
        }
        let mut allowed = FixedBitSet::with_capacity(vocab_size);
        let pda = self.pda();
        let mut accepting = false;
        if !self.terminated {
            let mut uncertain: Vec<u32> = Vec::new();
            for config in &self.configs {
                if pda.is_accepting(config) {
                    accepting = true;
                }
                if config.is_empty() {
                    continue;
                }
                let entry = position_of(config).and_then(|p| self.compiled.mask_entry(&p));
                match entry {
                    Some(mask) => {
                        match mask.store_type {
                            MaskStoreType::Accepted => {
                                for &token_id in &mask.indices {
                                    allowed.insert(token_id as usize);
                                }
                            }
                            MaskStoreType::Rejected => {
                                let mut set = self.compiled.all_normal_tokens().clone();
                                for &token_id in &mask.indices {
                                    set.set(token_id as usize, false);
                                }
                                for &token_id in &mask.uncertain {
                                    set.set(token_id as usize, false);
                                }
                                allowed.union_with(&set);
                            }
                        }
                        uncertain.extend_from_slice(&mask.uncertain);
                    }
                    None => {
                        // Uncached state (mid-codepoint): gather candidates
                        // through the first-byte index and verify them all.
                        let mut bytes = ByteSet::with_capacity(256);
                        pda.possible_next_bytes(config, &mut bytes);
                        for byte in bytes.ones() {
                            uncertain.extend(info.first_byte_to_token_ids[byte].ones().map(|t| t as u32));
                        }
                        uncertain.extend_from_slice(&info.empty_token_ids);
                    }
                }
            }
            uncertain.sort_unstable();
            uncertain.dedup();
            for token_id in uncertain {
                if allowed.contains(token_id as usize)
                    || self.stop_token_ids.contains(&(token_id as i32))
                {
                    continue;
                }
                if self.verify_token(&pda, token_id) {
                    allowed.insert(token_id as usize);
                }
            }
        }
        if accepting || self.terminated {
            for &stop in &self.stop_token_ids {
                if (stop as usize) < vocab_size {
                    allowed.insert(stop as usize);
                }
            }
        }
        bitmask
            .write_row_from_bitset(index, &allowed)
            .map_err(|_| MatcherError::BatchIndexOutOfRange(index))?;
        Ok(())
    }

    /// Speculatively advances the automaton by the token's bytes and rolls
    /// back, reporting whether any configuration survives.
    fn verify_token(&self, pda: &Pda<'_>, token_id: u32) -> bool {
        let info = self.compiled.tokenizer_info();
        let Some(bytes) = info.token_bytes(token_id) else {
            return false;
        };
        if bytes.is_empty() {
            return true;
        }
        let bytes = bytes.to_vec();
        let mut configs = self.configs.clone();
        for &byte in &bytes {
            configs = pda.advance_byte(&configs, byte, None);
            if configs.is_empty() {
                return false;
            }
        }
        true
    }

    /// Returns the longest byte string that is forced by the grammar from
    /// the current state. Does not mutate the matcher.
    pub fn find_jump_forward_string(&self) -> Vec<u8> {
        if self.terminated {
            return Vec::new();
        }
        let pda = self.pda();
        let mut configs = self.configs.clone();
        let mut jump = Vec::new();
        while jump.len() < MAX_JUMP_FORWARD_BYTES {
            if configs.iter().any(|c| pda.is_accepting(c)) {
                break;
            }
            let mut bytes = ByteSet::with_capacity(256);
            for config in &configs {
                pda.possible_next_bytes(config, &mut bytes);
            }
            let mut ones = bytes.ones();
            let (Some(first), None) = (ones.next(), ones.next()) else {
                break;
            };
            let next = pda.advance_byte(&configs, first as u8, None);
            if next.is_empty() {
                break;
            }
            jump.push(first as u8);
            configs = next;
        }
        jump
    }
}
