//! Parser header commoning: sibling parser states that extract different
//! header types with structurally identical leading fields get those fields
//! factored into a new header extracted once in the parent state. The
//! affected headers shrink to their residual fields and every field access
//! is retargeted onto the common header.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use id_arena::{Arena, Id};

use crate::diag::Diagnostics;
use crate::ir::visit::{
    transform_program, walk_program, Ctx, Inspector, Transform,
};
use crate::ir::{
    Decl, ExprKind, Expression, HeaderType, P, ParserState, Program, Statement, StructField,
    StructType, Type,
};
use crate::midend::errors::MidendError;

/// Reserved marker for synthesized common headers.
pub const COMMON_HDR: &str = "_common_";

/// Suffix of the struct field holding a common header instance.
const IN_HDR_SUFFIX: &str = "_in_hdr";

pub type StateId = Id<ParseStateInfo>;

/// Per-state record in the parser-state graph. The graph is a DAG plus
/// back-edges; every walk visits a state once.
#[derive(Debug, Default)]
pub struct ParseStateInfo {
    pub name: String,
    pub first_extracted: Option<String>,
    pub last_extracted: Option<String>,
    pub parents: BTreeSet<StateId>,
    pub children: BTreeSet<StateId>,
}

#[derive(Debug, Default)]
pub struct ParserStateGraph {
    states: Arena<ParseStateInfo>,
    by_name: BTreeMap<String, StateId>,
}

impl ParserStateGraph {
    pub fn state_id(&mut self, name: &str) -> StateId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = self.states.alloc(ParseStateInfo {
            name: name.to_string(),
            ..ParseStateInfo::default()
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn state(&self, id: StateId) -> &ParseStateInfo {
        &self.states[id]
    }

    pub fn lookup(&self, name: &str) -> Option<StateId> {
        self.by_name.get(name).copied()
    }

    fn add_edge(&mut self, from: StateId, to: StateId) {
        self.states[from].children.insert(to);
        self.states[to].parents.insert(from);
    }

    /// States in name order, mirroring the planning iteration.
    pub fn iter_named(&self) -> impl Iterator<Item = (&String, StateId)> {
        self.by_name.iter().map(|(name, id)| (name, *id))
    }
}

/// The whole commoning pass: collect, plan, rewrite.
pub struct CommonFields<'a> {
    diag: &'a Diagnostics,
    states: ParserStateGraph,
    headers: BTreeMap<String, P<HeaderType>>,
    /// Common header name -> synthesized declaration.
    new_headers: BTreeMap<String, P<HeaderType>>,
    /// Common header name -> names of the states that gain its extract.
    extract_states: BTreeMap<String, BTreeSet<String>>,
    /// Remapped header name -> residual declaration.
    modified_headers: BTreeMap<String, P<HeaderType>>,
    /// Remapped header name -> the common header absorbing its prefix.
    header_map: BTreeMap<String, String>,
    /// Remapped header name -> absorbed field names, indexed by ordinal
    /// position (residual and common fields keep their original names, so
    /// the mapping must be positional).
    remapped_fields: BTreeMap<String, Vec<String>>,
    common_hdr_no: u32,
    curr: Option<StateId>,
}

impl<'a> CommonFields<'a> {
    pub fn new(diag: &'a Diagnostics) -> Self {
        CommonFields {
            diag,
            states: ParserStateGraph::default(),
            headers: BTreeMap::new(),
            new_headers: BTreeMap::new(),
            extract_states: BTreeMap::new(),
            modified_headers: BTreeMap::new(),
            header_map: BTreeMap::new(),
            remapped_fields: BTreeMap::new(),
            common_hdr_no: 0,
            curr: None,
        }
    }

    pub fn run(mut self, prog: &P<Program>) -> Result<P<Program>, MidendError> {
        walk_program(&mut self, prog)?;
        self.plan()?;
        let mut result = Rc::clone(prog);
        let new_names: Vec<String> = self.new_headers.keys().cloned().collect();
        for name in new_names {
            let mut rewriter = ModifyHeaders {
                cf: &self,
                hdr_name: name,
            };
            result = transform_program(&mut rewriter, &result);
        }
        let modified_names: Vec<String> = self.modified_headers.keys().cloned().collect();
        for name in modified_names {
            let mut rewriter = ModifyHeaders {
                cf: &self,
                hdr_name: name,
            };
            result = transform_program(&mut rewriter, &result);
        }
        Ok(result)
    }

    /// A header name containing the reserved marker is rejected unless it
    /// has exactly the shape of this pass's own output over a declared base
    /// header, which keeps re-runs legal.
    fn check_reserved_names(&self) -> Result<(), MidendError> {
        for name in self.headers.keys() {
            if let Some(idx) = name.rfind(COMMON_HDR) {
                let base = &name[..idx];
                let suffix = &name[idx + COMMON_HDR.len()..];
                let output_shaped = !suffix.is_empty()
                    && suffix.bytes().all(|b| b.is_ascii_digit())
                    && self.headers.contains_key(base);
                if !output_shaped {
                    return Err(MidendError::ReservedHeaderName(name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Number of leading fields shared by two layouts: both fixed-width bit
    /// fields of equal width, compared by ordinal position. A variable-width
    /// field on either side is a hard boundary that keeps the prefix, as is
    /// a width mismatch between differently-named fields. A width mismatch
    /// between same-named fields is a conflicting redeclaration of one
    /// logical field and cancels commoning for the pair.
    fn find_common_fields(hdr1: &HeaderType, hdr2: &HeaderType) -> usize {
        let mut common = 0;
        for (pos, hf1) in hdr1.fields.iter().enumerate() {
            let hf2 = match hdr2.fields.get(pos) {
                Some(hf2) => hf2,
                None => break,
            };
            if hf1.ty.is_varbits() || hf2.ty.is_varbits() {
                break;
            }
            match (hf1.ty.bit_width(), hf2.ty.bit_width()) {
                (Some(w1), Some(w2)) if w1 == w2 => common += 1,
                _ => {
                    if hf1.name == hf2.name {
                        return 0;
                    }
                    break;
                }
            }
        }
        common
    }

    /// Common-prefix length over a state's successors: the minimum of the
    /// pairwise prefix against the first successor's header, a same-named
    /// successor counting as fully equal.
    fn common_prefix_len(&self, h0: &HeaderType, children: &[StateId]) -> usize {
        let mut least = h0.fields.len();
        for child in children.iter().skip(1) {
            let other = self.states.state(*child).first_extracted.as_deref();
            let lcp = match other {
                Some(name) if name == h0.name => h0.fields.len(),
                Some(name) => match self.headers.get(name) {
                    Some(hdr) => Self::find_common_fields(h0, hdr),
                    None => 0,
                },
                None => 0,
            };
            least = least.min(lcp);
        }
        least
    }

    fn plan(&mut self) -> Result<(), MidendError> {
        self.check_reserved_names()?;
        let branching: Vec<(StateId, Vec<StateId>)> = self
            .states
            .iter_named()
            .filter_map(|(_, id)| {
                let children: Vec<StateId> = self.states.state(id).children.iter().copied().collect();
                (children.len() > 1).then_some((id, children))
            })
            .collect();

        for (state, children) in branching {
            let h0 = children
                .first()
                .and_then(|c| self.states.state(*c).first_extracted.as_deref())
                .and_then(|name| self.headers.get(name))
                .cloned();
            let h0 = match h0 {
                Some(h0) => h0,
                None => continue,
            };
            let least = self.common_prefix_len(&h0, &children);
            if least == 0 {
                continue;
            }
            self.diag.structure(format!(
                "state {}: commoning {} leading field(s) of {}",
                self.states.state(state).name,
                least,
                h0.name
            ));

            let common_name = format!("{}{}{}", h0.name, COMMON_HDR, self.common_hdr_no);
            self.common_hdr_no += 1;
            self.new_headers.insert(
                common_name.clone(),
                Rc::new(HeaderType::new(
                    common_name.clone(),
                    h0.fields[..least].to_vec(),
                )),
            );
            let extract_states = self.extract_states.entry(common_name.clone()).or_default();

            for child in &children {
                let child_hdr_name = match self.states.state(*child).first_extracted.clone() {
                    Some(name) => name,
                    None => continue,
                };
                let child_hdr = match self.headers.get(&child_hdr_name).cloned() {
                    Some(hdr) => hdr,
                    None => continue,
                };
                extract_states.insert(self.states.state(*child).name.clone());
                if self.header_map.contains_key(&child_hdr_name) {
                    continue;
                }
                self.header_map
                    .insert(child_hdr_name.clone(), common_name.clone());
                self.remapped_fields.insert(
                    child_hdr_name.clone(),
                    child_hdr.fields[..least]
                        .iter()
                        .map(|f| f.name.clone())
                        .collect(),
                );
                self.modified_headers.insert(
                    child_hdr_name.clone(),
                    Rc::new(HeaderType::new(
                        child_hdr_name.clone(),
                        child_hdr.fields[least..].to_vec(),
                    )),
                );
                self.diag.summary(format!(
                    "header {} remapped onto {}",
                    child_hdr_name, common_name
                ));
            }
        }
        Ok(())
    }
}

impl<'a> Inspector for CommonFields<'a> {
    fn pre_header_type(&mut self, hdr: &P<HeaderType>, _cx: &Ctx) -> Result<(), MidendError> {
        self.diag.trace(format!("header {}", hdr.name));
        self.headers.insert(hdr.name.clone(), Rc::clone(hdr));
        Ok(())
    }

    fn pre_parser_state(
        &mut self,
        state: &P<ParserState>,
        _cx: &Ctx,
    ) -> Result<bool, MidendError> {
        let id = self.states.state_id(&state.name);
        self.curr = Some(id);
        Ok(true)
    }

    fn post_parser_state(
        &mut self,
        _state: &P<ParserState>,
        _cx: &Ctx,
    ) -> Result<(), MidendError> {
        self.curr = None;
        Ok(())
    }

    fn pre_expression(&mut self, expr: &P<Expression>, cx: &Ctx) -> Result<bool, MidendError> {
        match &expr.kind {
            ExprKind::Path(name) if cx.in_transition_target() => {
                if let Some(curr) = self.curr {
                    let target = self.states.state_id(name);
                    self.states.add_edge(curr, target);
                    self.diag.trace(format!(
                        "transition {} -> {}",
                        self.states.state(curr).name,
                        name
                    ));
                }
            }
            ExprKind::MethodCall {
                method, type_args, ..
            } => {
                let is_extract = matches!(
                    &method.kind,
                    ExprKind::Member { member, .. } if member == "extract"
                );
                if is_extract {
                    if let Some(curr) = self.curr {
                        for ty in type_args {
                            if let Some(name) = ty.header_name() {
                                let state = &mut self.states.states[curr];
                                if state.first_extracted.is_none() {
                                    state.first_extracted = Some(name.to_string());
                                }
                                state.last_extracted = Some(name.to_string());
                                self.diag.trace(format!("extracts {}", name));
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(true)
    }
}

/// Applies one planned header's worth of rewriting: declaration insertion or
/// replacement, the `headers` struct field, the prepended extract, and the
/// member retargeting. Applied once per affected header, re-rooting the
/// program each time, so already-rewritten subtrees are never revisited.
struct ModifyHeaders<'a, 'b> {
    cf: &'a CommonFields<'b>,
    hdr_name: String,
}

impl<'a, 'b> Transform for ModifyHeaders<'a, 'b> {
    fn program(&mut self, prog: &Program) -> Option<Program> {
        if let Some(new_hdr) = self.cf.new_headers.get(&self.hdr_name) {
            // Declare the common header right before the family it came from.
            let pos = prog.declarations.iter().position(|d| {
                matches!(d, Decl::Header(h) if self.hdr_name.starts_with(h.name.as_str()))
            })?;
            let mut declarations = prog.declarations.clone();
            declarations.insert(pos, Decl::Header(Rc::clone(new_hdr)));
            Some(Program { declarations })
        } else if let Some(residual) = self.cf.modified_headers.get(&self.hdr_name) {
            let pos = prog
                .declarations
                .iter()
                .position(|d| matches!(d, Decl::Header(h) if h.name == self.hdr_name))?;
            let mut declarations = prog.declarations.clone();
            declarations[pos] = Decl::Header(Rc::clone(residual));
            Some(Program { declarations })
        } else {
            None
        }
    }

    fn struct_type(&mut self, st: &P<StructType>) -> Option<P<StructType>> {
        if st.name != "headers" || !self.cf.new_headers.contains_key(&self.hdr_name) {
            return None;
        }
        let mut fields = st.fields.clone();
        fields.push(StructField {
            name: format!("{}{}", self.hdr_name, IN_HDR_SUFFIX),
            ty: Type::Header(self.hdr_name.clone()),
        });
        Some(Rc::new(StructType {
            name: st.name.clone(),
            fields,
        }))
    }

    fn post_parser_state(&mut self, state: &P<ParserState>) -> Option<P<ParserState>> {
        let gains_extract = self
            .cf
            .extract_states
            .get(&self.hdr_name)
            .map_or(false, |states| states.contains(&state.name));
        if !gains_extract {
            return None;
        }
        let field_name = format!("{}{}", self.hdr_name, IN_HDR_SUFFIX);
        let arg = Expression::member(
            Expression::typed_path("hdr", Type::Struct("headers".to_string())),
            field_name,
            Type::Header(self.hdr_name.clone()),
        );
        let method = Expression::member(Expression::path("packet"), "extract", Type::Unknown);
        let call = Statement::call(Expression::call(method, Vec::new(), vec![arg]));
        let mut components = Vec::with_capacity(state.components.len() + 1);
        components.push(call);
        components.extend(state.components.iter().cloned());
        Some(Rc::new(ParserState {
            name: state.name.clone(),
            components,
            transition: state.transition.clone(),
        }))
    }

    fn pre_expression(&mut self, expr: &P<Expression>) -> Option<P<Expression>> {
        let (base, member) = match &expr.kind {
            ExprKind::Member { base, member } => (base, member),
            _ => return None,
        };
        let base_hdr = base.ty.header_name()?;
        if self.cf.header_map.get(base_hdr)? != &self.hdr_name {
            return None;
        }
        let absorbed = self.cf.remapped_fields.get(base_hdr)?;
        let pos = absorbed.iter().position(|f| f == member)?;
        let new_hdr = self.cf.new_headers.get(&self.hdr_name)?;
        let new_field = new_hdr.fields[pos].name.clone();
        // Retarget onto the common header instance next to the original.
        let outer_base = match &base.kind {
            ExprKind::Member { base: b, .. } => Rc::clone(b),
            _ => return None,
        };
        let new_base = Expression::member(
            outer_base,
            format!("{}{}", self.hdr_name, IN_HDR_SUFFIX),
            Type::Header(self.hdr_name.clone()),
        );
        Some(Expression::member(new_base, new_field, expr.ty.clone()))
    }
}

/// Run header commoning; a program with no opportunity comes back as the
/// same shared root.
pub fn common_parser_headers(
    prog: &P<Program>,
    diag: &Diagnostics,
) -> Result<P<Program>, MidendError> {
    CommonFields::new(diag).run(prog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::HeaderField;

    fn hdr(name: &str, widths: &[(&str, Type)]) -> HeaderType {
        HeaderType::new(
            name,
            widths
                .iter()
                .map(|(n, ty)| HeaderField::new(*n, ty.clone()))
                .collect(),
        )
    }

    #[test]
    fn width_mismatch_on_same_name_cancels_the_pair() {
        let a = hdr(
            "A",
            &[("x", Type::Bits(8)), ("y", Type::Bits(16)), ("z", Type::Bits(4))],
        );
        let b = hdr(
            "B",
            &[("x", Type::Bits(8)), ("y", Type::Bits(12)), ("w", Type::Bits(8))],
        );
        assert_eq!(CommonFields::find_common_fields(&a, &b), 0);
    }

    #[test]
    fn width_mismatch_on_different_names_keeps_the_prefix() {
        let a = hdr(
            "A",
            &[("x", Type::Bits(8)), ("y", Type::Bits(16)), ("z", Type::Bits(4))],
        );
        let b = hdr(
            "B",
            &[("x", Type::Bits(8)), ("y", Type::Bits(16)), ("w", Type::Bits(8))],
        );
        assert_eq!(CommonFields::find_common_fields(&a, &b), 2);
    }

    #[test]
    fn varbits_is_a_hard_boundary() {
        let c = hdr("C", &[("x", Type::Bits(8)), ("v", Type::Varbits(32))]);
        let d = hdr("D", &[("x", Type::Bits(8)), ("w", Type::Bits(32))]);
        assert_eq!(CommonFields::find_common_fields(&c, &d), 1);
        assert_eq!(CommonFields::find_common_fields(&d, &c), 1);
    }

    #[test]
    fn shorter_header_bounds_the_prefix() {
        let a = hdr("A", &[("x", Type::Bits(8)), ("y", Type::Bits(16))]);
        let b = hdr("B", &[("x", Type::Bits(8))]);
        assert_eq!(CommonFields::find_common_fields(&a, &b), 1);
    }

    #[test]
    fn reserved_name_check_rejects_collisions() {
        let diag = Diagnostics::silent();
        let mut cf = CommonFields::new(&diag);
        cf.headers.insert(
            "evil_common_header".to_string(),
            Rc::new(hdr("evil_common_header", &[("x", Type::Bits(8))])),
        );
        assert!(matches!(
            cf.check_reserved_names(),
            Err(MidendError::ReservedHeaderName(_))
        ));
    }

    #[test]
    fn reserved_name_check_accepts_own_output_shape() {
        let diag = Diagnostics::silent();
        let mut cf = CommonFields::new(&diag);
        cf.headers
            .insert("A".to_string(), Rc::new(hdr("A", &[("z", Type::Bits(4))])));
        cf.headers.insert(
            "A_common_0".to_string(),
            Rc::new(hdr("A_common_0", &[("x", Type::Bits(8))])),
        );
        assert!(cf.check_reserved_names().is_ok());
    }
}
