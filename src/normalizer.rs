//! The grammar normalizer pipeline.
//!
//! A fixed sequence of IR-to-IR passes brings every rule body into the
//! canonical choice-of-sequences form the compiler and matcher assume:
//!
//! 1. [`expand_repetitions`] lowers `RepeatRange` nodes into helper rules.
//! 2. [`structure_normalizer`] flattens nested sequences and choices and
//!    hoists choices found inside sequences into `<rule>_choice` helpers.
//! 3. [`rule_inliner`] inlines cheap head-position rule references.
//! 4. [`byte_string_fuser`] turns single-codepoint classes into byte strings
//!    and concatenates adjacent byte strings.
//! 5. [`dead_code_eliminator`] drops rules unreachable from the root.
//! 6. The allow-empty analyzer computes the rules whose language contains
//!    the empty string (a least fixpoint over rule ids).
//!
//! Rule lookaheads are carried through every pass unchanged; the compiler
//! reads them directly from the rule table when building the token-mask
//! cache. Running the pipeline twice yields identical output.
use ahash::AHashSet;

use crate::grammar::{ExprId, ExprView, Grammar, GrammarBuilder, RuleId, TagDispatchSpec};

/// Runs the full pipeline.
pub fn normalize(grammar: &Grammar) -> Grammar {
    let grammar = expand_repetitions(grammar);
    let grammar = structure_normalizer(&grammar);
    let grammar = byte_string_fuser(&grammar);
    let grammar = rule_inliner(&grammar);
    let mut grammar = dead_code_eliminator(&grammar);
    grammar.allow_empty_rule_ids = compute_allow_empty(&grammar);
    grammar
}

/// Copies an expression between grammars without structural changes. Rule
/// ids must be stable between `grammar` and `builder`.
fn copy_expr(grammar: &Grammar, builder: &mut GrammarBuilder, expr_id: ExprId) -> ExprId {
    map_expr(grammar, builder, expr_id, &|id| id)
}

/// Copies an expression, remapping rule ids through `rule_map`.
fn map_expr(
    grammar: &Grammar,
    builder: &mut GrammarBuilder,
    expr_id: ExprId,
    rule_map: &dyn Fn(i32) -> i32,
) -> ExprId {
    match grammar.expr(expr_id) {
        ExprView::ByteString(bytes) => {
            let bytes: Vec<u8> = bytes.iter().map(|&b| b as u8).collect();
            builder.byte_string(&bytes)
        }
        ExprView::CharClass { negated, ranges } => {
            let pairs: Vec<(u32, u32)> =
                ranges.chunks_exact(2).map(|p| (p[0] as u32, p[1] as u32)).collect();
            builder.char_class(negated, &pairs)
        }
        ExprView::CharClassStar { negated, ranges } => {
            let pairs: Vec<(u32, u32)> =
                ranges.chunks_exact(2).map(|p| (p[0] as u32, p[1] as u32)).collect();
            builder.char_class_star(negated, &pairs)
        }
        ExprView::EmptyStr => builder.empty_str(),
        ExprView::RuleRef(rule) => builder.rule_ref(RuleId(rule_map(rule))),
        ExprView::Sequence(children) => {
            let children = children.to_vec();
            let mapped: Vec<ExprId> = children
                .iter()
                .map(|&c| map_expr(grammar, builder, ExprId(c), rule_map))
                .collect();
            builder.sequence(&mapped)
        }
        ExprView::Choice(children) => {
            let children = children.to_vec();
            let mapped: Vec<ExprId> = children
                .iter()
                .map(|&c| map_expr(grammar, builder, ExprId(c), rule_map))
                .collect();
            builder.choice(&mapped)
        }
        ExprView::TagDispatch(payload) => {
            let spec = TagDispatchSpec::decode(payload);
            let pairs: Vec<(ExprId, RuleId)> = spec
                .pairs
                .iter()
                .map(|&(trigger, rule)| {
                    (
                        map_expr(grammar, builder, trigger, rule_map),
                        RuleId(rule_map(rule.0)),
                    )
                })
                .collect();
            let stop_strs: Vec<ExprId> = spec
                .stop_strs
                .iter()
                .map(|&s| map_expr(grammar, builder, s, rule_map))
                .collect();
            let excludes: Vec<ExprId> = spec
                .excludes
                .iter()
                .map(|&e| map_expr(grammar, builder, e, rule_map))
                .collect();
            builder.tag_dispatch(&TagDispatchSpec {
                pairs,
                stop_eos: spec.stop_eos,
                stop_strs,
                loop_after_dispatch: spec.loop_after_dispatch,
                excludes,
            })
        }
        ExprView::RepeatRange { expr, min, max } => {
            let child = map_expr(grammar, builder, ExprId(expr), rule_map);
            builder.repeat_range(child, min, max)
        }
    }
}

fn declare_all_rules(grammar: &Grammar, builder: &mut GrammarBuilder) {
    for rule in &grammar.rules {
        builder.add_rule(&rule.name);
    }
}

fn copy_lookahead(grammar: &Grammar, builder: &mut GrammarBuilder, rule_index: usize) {
    let lookahead = grammar.rules[rule_index].lookahead_expr_id;
    if lookahead >= 0 {
        let copied = copy_expr(grammar, builder, ExprId(lookahead));
        builder.set_rule_lookahead(RuleId(rule_index as i32), copied);
    }
}

fn finalize_same_root(grammar: &Grammar, builder: GrammarBuilder) -> Grammar {
    let mut result = builder
        .finalize(RuleId(grammar.root_rule_id))
        .expect("normalizer passes define every rule body");
    result.allow_empty_rule_ids = grammar.allow_empty_rule_ids.clone();
    result
}

/// Expands `RepeatRange` nodes into sequences and helper-rule chains.
pub fn expand_repetitions(grammar: &Grammar) -> Grammar {
    let mut builder = GrammarBuilder::new();
    declare_all_rules(grammar, &mut builder);
    for index in 0..grammar.rules.len() {
        let rule_name = grammar.rules[index].name.clone();
        let body = ExprId(grammar.rules[index].body_expr_id);
        let new_body = expand_repetitions_expr(grammar, &mut builder, body, &rule_name);
        builder.set_rule_body(RuleId(index as i32), new_body);
        copy_lookahead(grammar, &mut builder, index);
    }
    finalize_same_root(grammar, builder)
}

fn expand_repetitions_expr(
    grammar: &Grammar,
    builder: &mut GrammarBuilder,
    expr_id: ExprId,
    rule_name: &str,
) -> ExprId {
    match grammar.expr(expr_id) {
        ExprView::Sequence(children) => {
            let children = children.to_vec();
            let mapped: Vec<ExprId> = children
                .iter()
                .map(|&c| expand_repetitions_expr(grammar, builder, ExprId(c), rule_name))
                .collect();
            builder.sequence(&mapped)
        }
        ExprView::Choice(children) => {
            let children = children.to_vec();
            let mapped: Vec<ExprId> = children
                .iter()
                .map(|&c| expand_repetitions_expr(grammar, builder, ExprId(c), rule_name))
                .collect();
            builder.choice(&mapped)
        }
        ExprView::RepeatRange { expr, min, max } => {
            let child = expand_repetitions_expr(grammar, builder, ExprId(expr), rule_name);
            expand_one_repetition(builder, child, min, max, rule_name)
        }
        _ => copy_expr(grammar, builder, expr_id),
    }
}

fn expand_one_repetition(
    builder: &mut GrammarBuilder,
    child: ExprId,
    min: i32,
    max: i32,
    rule_name: &str,
) -> ExprId {
    let min = min.max(0) as usize;
    if max < 0 {
        // {m,}: m mandatory copies followed by a star-shaped helper.
        let helper_name = builder.fresh_numbered_name(rule_name);
        let helper = builder.add_rule(&helper_name);
        let empty = builder.empty_str();
        let recursion = builder.rule_ref(helper);
        let step = builder.sequence(&[child, recursion]);
        let body = builder.choice(&[empty, step]);
        builder.set_rule_body(helper, body);
        if min == 0 {
            return builder.rule_ref(helper);
        }
        let mut elements = vec![child; min];
        elements.push(builder.rule_ref(helper));
        return builder.sequence(&elements);
    }
    let max = max as usize;
    let optional = max - min;
    if optional == 0 {
        return match min {
            0 => builder.sequence(&[]),
            1 => child,
            _ => builder.sequence(&vec![child; min]),
        };
    }
    // {m,n}: a chain of nullable helpers, one per optional copy.
    let helpers: Vec<RuleId> = (0..optional)
        .map(|_| {
            let name = builder.fresh_numbered_name(rule_name);
            builder.add_rule(&name)
        })
        .collect();
    for (i, &helper) in helpers.iter().enumerate() {
        let empty = builder.empty_str();
        let tail = if i + 1 < optional {
            let next = builder.rule_ref(helpers[i + 1]);
            builder.sequence(&[child, next])
        } else {
            child
        };
        let body = builder.choice(&[empty, tail]);
        builder.set_rule_body(helper, body);
    }
    if min == 0 {
        builder.rule_ref(helpers[0])
    } else {
        let mut elements = vec![child; min];
        elements.push(builder.rule_ref(helpers[0]));
        builder.sequence(&elements)
    }
}

/// One normalized branch of a rule body: either empty or a sequence of
/// atomic expressions (in the target builder).
enum Branch {
    Empty,
    Atoms(Vec<ExprId>),
}

/// Rewrites every rule body into the canonical choice-of-sequences form,
/// hoisting nested choices into `<rule>_choice` helper rules.
pub fn structure_normalizer(grammar: &Grammar) -> Grammar {
    let mut builder = GrammarBuilder::new();
    declare_all_rules(grammar, &mut builder);
    // Helper rules created during hoisting are queued with their source
    // expression and processed like ordinary rules.
    let mut pending: Vec<(RuleId, ExprId)> = (0..grammar.rules.len())
        .map(|i| (RuleId(i as i32), ExprId(grammar.rules[i].body_expr_id)))
        .collect();
    // Lookaheads first, so choices hoisted out of them queue helper rules on
    // the same worklist as the rule bodies.
    for index in 0..grammar.rules.len() {
        let lookahead = grammar.rules[index].lookahead_expr_id;
        if lookahead >= 0 {
            let rule_name = grammar.rules[index].name.clone();
            let branches =
                collect_branches(grammar, &mut builder, ExprId(lookahead), &rule_name, &mut pending);
            let normalized = emit_branches(&mut builder, branches, false);
            builder.set_rule_lookahead(RuleId(index as i32), normalized);
        }
    }
    let mut processed = 0usize;
    while processed < pending.len() {
        let (rule_id, body) = pending[processed];
        processed += 1;
        if matches!(grammar.expr(body), ExprView::TagDispatch(_)) {
            let copied = copy_expr(grammar, &mut builder, body);
            builder.set_rule_body(rule_id, copied);
            continue;
        }
        let rule_name = builder.rule_name(rule_id).to_string();
        let branches = collect_branches(grammar, &mut builder, body, &rule_name, &mut pending);
        let normalized = emit_branches(&mut builder, branches, true);
        builder.set_rule_body(rule_id, normalized);
    }
    finalize_same_root(grammar, builder)
}

/// Flattens an expression into normalized branches.
fn collect_branches(
    grammar: &Grammar,
    builder: &mut GrammarBuilder,
    expr_id: ExprId,
    rule_name: &str,
    pending: &mut Vec<(RuleId, ExprId)>,
) -> Vec<Branch> {
    match grammar.expr(expr_id) {
        ExprView::Choice(children) => {
            let children = children.to_vec();
            let mut branches = Vec::new();
            for child in children {
                branches.extend(collect_branches(grammar, builder, ExprId(child), rule_name, pending));
            }
            branches
        }
        ExprView::EmptyStr => vec![Branch::Empty],
        ExprView::Sequence(children) => {
            let children = children.to_vec();
            let mut atoms = Vec::new();
            for child in children {
                flatten_sequence_element(grammar, builder, ExprId(child), rule_name, pending, &mut atoms);
            }
            if atoms.is_empty() {
                vec![Branch::Empty]
            } else {
                vec![Branch::Atoms(atoms)]
            }
        }
        _ => {
            let mut atoms = Vec::new();
            flatten_sequence_element(grammar, builder, expr_id, rule_name, pending, &mut atoms);
            if atoms.is_empty() {
                vec![Branch::Empty]
            } else {
                vec![Branch::Atoms(atoms)]
            }
        }
    }
}

/// Appends the atoms of one sequence element, splicing nested sequences and
/// hoisting real choices.
fn flatten_sequence_element(
    grammar: &Grammar,
    builder: &mut GrammarBuilder,
    expr_id: ExprId,
    rule_name: &str,
    pending: &mut Vec<(RuleId, ExprId)>,
    atoms: &mut Vec<ExprId>,
) {
    match grammar.expr(expr_id) {
        ExprView::EmptyStr => {}
        ExprView::Sequence(children) => {
            let children = children.to_vec();
            for child in children {
                flatten_sequence_element(grammar, builder, ExprId(child), rule_name, pending, atoms);
            }
        }
        ExprView::Choice(children) => {
            let children = children.to_vec();
            // A choice that flattens to a single branch is spliced inline;
            // anything else becomes a hoisted helper rule.
            let flat = count_flat_branches(grammar, expr_id);
            if flat <= 1 {
                for child in children {
                    flatten_sequence_element(grammar, builder, ExprId(child), rule_name, pending, atoms);
                }
                return;
            }
            let helper_name = builder.fresh_name(&format!("{}_choice", rule_name));
            let helper = builder.add_rule(&helper_name);
            pending.push((helper, expr_id));
            atoms.push(builder.rule_ref(helper));
        }
        _ => {
            atoms.push(copy_expr(grammar, builder, expr_id));
        }
    }
}

/// Counts the branches an expression would flatten into, without building
/// anything.
fn count_flat_branches(grammar: &Grammar, expr_id: ExprId) -> usize {
    match grammar.expr(expr_id) {
        ExprView::Choice(children) => {
            let children = children.to_vec();
            children.iter().map(|&c| count_flat_branches(grammar, ExprId(c))).sum()
        }
        _ => 1,
    }
}

/// Emits branches as a canonical body: an optional leading `""` plus one
/// `Sequence` per non-empty branch, wrapped in a `Choice`. When
/// `wrap_single` is false a sole branch is emitted bare (used for
/// lookaheads).
fn emit_branches(builder: &mut GrammarBuilder, branches: Vec<Branch>, wrap_single: bool) -> ExprId {
    let mut has_empty = false;
    let mut emitted: Vec<ExprId> = Vec::new();
    for branch in &branches {
        match branch {
            Branch::Empty => has_empty = true,
            Branch::Atoms(atoms) => {
                let seq = builder.sequence(atoms);
                emitted.push(seq);
            }
        }
    }
    let mut all = Vec::with_capacity(emitted.len() + 1);
    if has_empty {
        all.push(builder.empty_str());
    }
    all.extend(emitted);
    if all.is_empty() {
        all.push(builder.empty_str());
    }
    if !wrap_single && all.len() == 1 {
        return all[0];
    }
    builder.choice(&all)
}

/// Inlines head-position references to cheap, atom-only rules.
///
/// A reference is inlined when it is the first element of a branch and the
/// callee (a) is not the caller, (b) has a body whose branches are
/// non-empty sequences of non-reference atoms, and (c) is referenced
/// exactly once in the whole grammar or is small (at most 4 branches and 8
/// atoms in total).
pub fn rule_inliner(grammar: &Grammar) -> Grammar {
    // Count references from reachable rules only, so that dead rules (which
    // a later pass removes) cannot influence inlining decisions.
    let mut reachable: AHashSet<i32> = AHashSet::default();
    let mut stack = vec![grammar.root_rule_id];
    while let Some(rule) = stack.pop() {
        if !reachable.insert(rule) {
            continue;
        }
        collect_rule_refs(grammar, ExprId(grammar.rules[rule as usize].body_expr_id), &mut stack);
        let lookahead = grammar.rules[rule as usize].lookahead_expr_id;
        if lookahead >= 0 {
            collect_rule_refs(grammar, ExprId(lookahead), &mut stack);
        }
    }
    let mut ref_counts = vec![0usize; grammar.rules.len()];
    for &rule in &reachable {
        let mut refs = Vec::new();
        collect_rule_refs(grammar, ExprId(grammar.rules[rule as usize].body_expr_id), &mut refs);
        let lookahead = grammar.rules[rule as usize].lookahead_expr_id;
        if lookahead >= 0 {
            collect_rule_refs(grammar, ExprId(lookahead), &mut refs);
        }
        for target in refs {
            ref_counts[target as usize] += 1;
        }
    }
    let inlinable: Vec<bool> = (0..grammar.rules.len())
        .map(|i| is_inlinable(grammar, i, ref_counts[i]))
        .collect();

    let mut builder = GrammarBuilder::new();
    declare_all_rules(grammar, &mut builder);
    for index in 0..grammar.rules.len() {
        let body = ExprId(grammar.rules[index].body_expr_id);
        let new_body = if matches!(grammar.expr(body), ExprView::TagDispatch(_)) {
            copy_expr(grammar, &mut builder, body)
        } else {
            inline_body(grammar, &mut builder, body, index, &inlinable)
        };
        builder.set_rule_body(RuleId(index as i32), new_body);
        copy_lookahead(grammar, &mut builder, index);
    }
    finalize_same_root(grammar, builder)
}

fn branch_atoms(grammar: &Grammar, branch: ExprId) -> Vec<ExprId> {
    match grammar.expr(branch) {
        ExprView::Sequence(children) => children.iter().map(|&c| ExprId(c)).collect(),
        ExprView::EmptyStr => Vec::new(),
        _ => vec![branch],
    }
}

fn body_branches(grammar: &Grammar, body: ExprId) -> Vec<ExprId> {
    match grammar.expr(body) {
        ExprView::Choice(children) => children.iter().map(|&c| ExprId(c)).collect(),
        _ => vec![body],
    }
}

fn is_inlinable(grammar: &Grammar, rule_index: usize, ref_count: usize) -> bool {
    let body = ExprId(grammar.rules[rule_index].body_expr_id);
    if matches!(grammar.expr(body), ExprView::TagDispatch(_)) {
        return false;
    }
    if grammar.rules[rule_index].lookahead_expr_id >= 0 {
        return false;
    }
    let branches = body_branches(grammar, body);
    let mut total_atoms = 0usize;
    for &branch in &branches {
        let atoms = branch_atoms(grammar, branch);
        if atoms.is_empty() {
            // Nullable rules stay as references.
            return false;
        }
        for &atom in &atoms {
            match grammar.expr(atom) {
                ExprView::ByteString(_)
                | ExprView::CharClass { .. }
                | ExprView::CharClassStar { .. } => {}
                _ => return false,
            }
        }
        total_atoms += atoms.len();
    }
    ref_count == 1 || (branches.len() <= 4 && total_atoms <= 8)
}

fn inline_body(
    grammar: &Grammar,
    builder: &mut GrammarBuilder,
    body: ExprId,
    rule_index: usize,
    inlinable: &[bool],
) -> ExprId {
    let branches = body_branches(grammar, body);
    let mut emitted: Vec<ExprId> = Vec::new();
    let mut has_empty = false;
    for &branch in &branches {
        let atoms = branch_atoms(grammar, branch);
        if atoms.is_empty() {
            has_empty = true;
            continue;
        }
        let head_target = match grammar.expr(atoms[0]) {
            ExprView::RuleRef(target)
                if target as usize != rule_index && inlinable[target as usize] =>
            {
                Some(target)
            }
            _ => None,
        };
        match head_target {
            Some(target) => {
                let callee_body = ExprId(grammar.rules[target as usize].body_expr_id);
                for &callee_branch in &body_branches(grammar, callee_body) {
                    let mut elements: Vec<ExprId> = branch_atoms(grammar, callee_branch);
                    elements.extend(atoms[1..].iter().copied());
                    // Fuse across the junction so a second pipeline run has
                    // nothing left to do.
                    let fused = fuse_atoms(grammar, builder, &elements);
                    let seq = builder.sequence(&fused);
                    emitted.push(seq);
                }
            }
            None => {
                let fused = fuse_atoms(grammar, builder, &atoms);
                let seq = builder.sequence(&fused);
                emitted.push(seq);
            }
        }
    }
    let mut all = Vec::with_capacity(emitted.len() + 1);
    if has_empty {
        all.push(builder.empty_str());
    }
    all.extend(emitted);
    if all.is_empty() {
        all.push(builder.empty_str());
    }
    builder.choice(&all)
}

/// Converts single-codepoint positive classes into byte strings and fuses
/// adjacent byte strings inside every branch.
pub fn byte_string_fuser(grammar: &Grammar) -> Grammar {
    let mut builder = GrammarBuilder::new();
    declare_all_rules(grammar, &mut builder);
    for index in 0..grammar.rules.len() {
        let body = ExprId(grammar.rules[index].body_expr_id);
        let new_body = if matches!(grammar.expr(body), ExprView::TagDispatch(_)) {
            copy_expr(grammar, &mut builder, body)
        } else {
            let branches = body_branches(grammar, body);
            let mut emitted: Vec<ExprId> = Vec::new();
            for &branch in &branches {
                if matches!(grammar.expr(branch), ExprView::EmptyStr) {
                    emitted.push(builder.empty_str());
                    continue;
                }
                let atoms = branch_atoms(grammar, branch);
                let fused = fuse_atoms(grammar, &mut builder, &atoms);
                let seq = builder.sequence(&fused);
                emitted.push(seq);
            }
            builder.choice(&emitted)
        };
        builder.set_rule_body(RuleId(index as i32), new_body);
        copy_lookahead(grammar, &mut builder, index);
    }
    finalize_same_root(grammar, builder)
}

fn fuse_atoms(grammar: &Grammar, builder: &mut GrammarBuilder, atoms: &[ExprId]) -> Vec<ExprId> {
    let mut fused: Vec<ExprId> = Vec::new();
    let mut pending_bytes: Vec<u8> = Vec::new();
    for &atom in atoms {
        let bytes: Option<Vec<u8>> = match grammar.expr(atom) {
            ExprView::ByteString(b) => Some(b.iter().map(|&x| x as u8).collect()),
            ExprView::CharClass { negated: false, ranges } if ranges.len() == 2 && ranges[0] == ranges[1] => {
                let mut buf = Vec::new();
                if let Some(ch) = char::from_u32(ranges[0] as u32) {
                    let mut tmp = [0u8; 4];
                    buf.extend_from_slice(ch.encode_utf8(&mut tmp).as_bytes());
                    Some(buf)
                } else {
                    None
                }
            }
            _ => None,
        };
        match bytes {
            Some(bytes) => pending_bytes.extend_from_slice(&bytes),
            None => {
                if !pending_bytes.is_empty() {
                    let bs = builder.byte_string(&pending_bytes);
                    fused.push(bs);
                    pending_bytes.clear();
                }
                fused.push(copy_expr(grammar, builder, atom));
            }
        }
    }
    if !pending_bytes.is_empty() {
        let bs = builder.byte_string(&pending_bytes);
        fused.push(bs);
    }
    fused
}

/// Removes rules unreachable from the root, renumbering the survivors in
/// their original order.
pub fn dead_code_eliminator(grammar: &Grammar) -> Grammar {
    let mut reachable: AHashSet<i32> = AHashSet::default();
    let mut stack = vec![grammar.root_rule_id];
    while let Some(rule) = stack.pop() {
        if !reachable.insert(rule) {
            continue;
        }
        let body = ExprId(grammar.rules[rule as usize].body_expr_id);
        collect_rule_refs(grammar, body, &mut stack);
        let lookahead = grammar.rules[rule as usize].lookahead_expr_id;
        if lookahead >= 0 {
            collect_rule_refs(grammar, ExprId(lookahead), &mut stack);
        }
    }
    let mut rule_map = vec![-1i32; grammar.rules.len()];
    let mut builder = GrammarBuilder::new();
    for (index, rule) in grammar.rules.iter().enumerate() {
        if reachable.contains(&(index as i32)) {
            let new_id = builder.add_rule(&rule.name);
            rule_map[index] = new_id.0;
        }
    }
    for (index, rule) in grammar.rules.iter().enumerate() {
        if rule_map[index] < 0 {
            continue;
        }
        let map = |old: i32| rule_map[old as usize];
        let body = map_expr(grammar, &mut builder, ExprId(rule.body_expr_id), &map);
        builder.set_rule_body(RuleId(rule_map[index]), body);
        if rule.lookahead_expr_id >= 0 {
            let lookahead = map_expr(grammar, &mut builder, ExprId(rule.lookahead_expr_id), &map);
            builder.set_rule_lookahead(RuleId(rule_map[index]), lookahead);
        }
    }
    let mut result = builder
        .finalize(RuleId(rule_map[grammar.root_rule_id as usize]))
        .expect("reachable rules keep their bodies");
    result.allow_empty_rule_ids = Vec::new();
    result
}

fn collect_rule_refs(grammar: &Grammar, expr_id: ExprId, out: &mut Vec<i32>) {
    match grammar.expr(expr_id) {
        ExprView::RuleRef(rule) => out.push(rule),
        ExprView::Sequence(children) | ExprView::Choice(children) => {
            for &child in children {
                collect_rule_refs(grammar, ExprId(child), out);
            }
        }
        ExprView::TagDispatch(payload) => {
            let spec = TagDispatchSpec::decode(payload);
            for (_, rule) in spec.pairs {
                out.push(rule.0);
            }
        }
        ExprView::RepeatRange { expr, .. } => collect_rule_refs(grammar, ExprId(expr), out),
        _ => {}
    }
}

/// Computes the rules whose language contains the empty string as a least
/// fixpoint over the rule table.
pub(crate) fn compute_allow_empty(grammar: &Grammar) -> Vec<i32> {
    let mut empty = vec![false; grammar.rules.len()];
    loop {
        let mut changed = false;
        for index in 0..grammar.rules.len() {
            if empty[index] {
                continue;
            }
            let body = ExprId(grammar.rules[index].body_expr_id);
            if expr_allows_empty(grammar, body, &empty) {
                empty[index] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    (0..grammar.rules.len() as i32).filter(|&i| empty[i as usize]).collect()
}

fn expr_allows_empty(grammar: &Grammar, expr_id: ExprId, empty: &[bool]) -> bool {
    match grammar.expr(expr_id) {
        ExprView::EmptyStr => true,
        ExprView::ByteString(bytes) => bytes.is_empty(),
        ExprView::CharClass { .. } => false,
        ExprView::CharClassStar { .. } => true,
        ExprView::RuleRef(rule) => empty[rule as usize],
        ExprView::Sequence(children) => children
            .iter()
            .all(|&c| expr_allows_empty(grammar, ExprId(c), empty)),
        ExprView::Choice(children) => children
            .iter()
            .any(|&c| expr_allows_empty(grammar, ExprId(c), empty)),
        ExprView::TagDispatch(payload) => TagDispatchSpec::decode(payload).stop_eos,
        ExprView::RepeatRange { expr, min, .. } => {
            min == 0 || expr_allows_empty(grammar, ExprId(expr), empty)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Grammar;

    fn parse(text: &str) -> Grammar {
        Grammar::from_ebnf_no_normalization(text, "root").unwrap()
    }

    #[test]
    fn test_structure_normalizer_flattens() {
        let grammar = parse("root ::= \"a\" (\"b\" | \"c\" \"d\") | ((\"e\" \"f\"))\n");
        let normalized = structure_normalizer(&grammar);
        assert_eq!(
            normalized.to_string(),
            "root ::= ((\"a\" root_choice) | (\"e\" \"f\"))\nroot_choice ::= ((\"b\") | (\"c\" \"d\"))\n"
        );
    }

    #[test]
    fn test_empty_first() {
        let grammar = parse("root ::= \"d\" | \"\" | \"a\" \"\"\n");
        let normalized = structure_normalizer(&grammar);
        assert_eq!(normalized.to_string(), "root ::= (\"\" | (\"d\") | (\"a\"))\n");
    }

    #[test]
    fn test_byte_string_fuser() {
        let grammar = parse("root ::= \"a\" [b] \"cd\"\n");
        let normalized = byte_string_fuser(&structure_normalizer(&grammar));
        assert_eq!(normalized.to_string(), "root ::= ((\"abcd\"))\n");
    }

    #[test]
    fn test_dead_code_eliminator() {
        let grammar = parse("root ::= rule1\nrule1 ::= \"a\"\nunused ::= \"x\"\n");
        let eliminated = dead_code_eliminator(&grammar);
        assert_eq!(eliminated.to_string(), "root ::= (rule1)\nrule1 ::= (\"a\")\n");
    }

    #[test]
    fn test_allow_empty() {
        let grammar = crate::normalizer::normalize(&parse(
            "root ::= a b\na ::= \"x\" | \"\"\nb ::= \"y\"\n",
        ));
        let empty = grammar.allow_empty_rule_ids();
        let names: Vec<&str> = empty
            .iter()
            .map(|&i| grammar.rule(crate::grammar::RuleId(i)).name())
            .collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn test_idempotence() {
        let text = "root ::= (\"a\" | \"b\")* \"c\" {2,4} rest\nrest ::= [x-z]+ | \"\"\n";
        let grammar = parse(text);
        let once = normalize(&grammar);
        let twice = normalize(&once);
        assert_eq!(once.to_string(), twice.to_string());
    }
}
