//! Schema AST → constraint forest.
//!
//! Lowers every supported keyword into its canonical constraint form,
//! wrapped in an outer token switch whose inactive slots default to
//! valid when no `type` is declared and invalid otherwise. Also
//! collects the id tables: every schema location gets its JSON-pointer
//! label (plus any declared `$id`), and `$ref` targets are resolved
//! into `ref_ids` once the whole document has been walked.

use std::collections::BTreeSet;

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;

use jsv_asm::{EventKind, MatchPattern, SWITCH_KINDS};

use crate::schema::{
    check_pattern, child_path, expect_array, expect_bool, expect_count, expect_f64, expect_object,
    expect_str, index_path, malformed, ptr_unescape,
};
use crate::CompileError;

use super::{
    Cnode, CnodeArena, CnodeForest, CnodeId, CnodeList, CountKind, CountRange, NumRange, RangeFlags,
};

/// Keywords that are understood but deliberately not compiled.
const UNSUPPORTED: &[&str] = &[
    "$anchor",
    "$defs",
    "$dynamicAnchor",
    "$dynamicRef",
    "contentEncoding",
    "contentMediaType",
    "dependentRequired",
    "dependentSchemas",
    "else",
    "format",
    "if",
    "prefixItems",
    "then",
    "unevaluatedItems",
    "unevaluatedProperties",
];

/// Keywords handled by the lowering tables below.
const KNOWN: &[&str] = &[
    "$id",
    "$ref",
    "additionalItems",
    "additionalProperties",
    "allOf",
    "anyOf",
    "const",
    "contains",
    "definitions",
    "dependencies",
    "enum",
    "exclusiveMaximum",
    "exclusiveMinimum",
    "items",
    "maxItems",
    "maxLength",
    "maxProperties",
    "maximum",
    "minItems",
    "minLength",
    "minProperties",
    "minimum",
    "multipleOf",
    "not",
    "oneOf",
    "pattern",
    "patternProperties",
    "properties",
    "propertyNames",
    "required",
    "type",
    "uniqueItems",
];

/// Annotation keywords that carry no constraints.
const IGNORED: &[&str] = &[
    "$comment",
    "$schema",
    "default",
    "description",
    "examples",
    "title",
];

/// Translate a schema AST into a constraint forest.
pub fn translate(schema: &Value) -> Result<CnodeForest, CompileError> {
    let mut tx = Translator::default();
    let root = tx.schema_node(schema, "#")?;
    tx.all_ids.insert("#".to_string(), root);
    tx.resolve_refs()?;
    Ok(tx.into_forest(root))
}

#[derive(Default)]
struct Translator {
    arena: CnodeArena,
    all_ids: IndexMap<String, CnodeId>,
    ref_ids: IndexSet<String>,
    // Ref nodes are allocated with the raw target string and patched
    // once every $id has been seen.
    pending_refs: Vec<(CnodeId, String, String)>,
}

impl Translator {
    fn alloc(&mut self, node: Cnode) -> CnodeId {
        self.arena.alloc(node)
    }

    fn valid(&mut self) -> CnodeId {
        self.alloc(Cnode::Valid)
    }

    fn invalid(&mut self) -> CnodeId {
        self.alloc(Cnode::Invalid)
    }

    /// Translate one (sub)schema, registering its location label.
    fn schema_node(&mut self, v: &Value, path: &str) -> Result<CnodeId, CompileError> {
        let node = self.schema_node_inner(v, path)?;
        self.all_ids.insert(path.to_string(), node);
        Ok(node)
    }

    fn schema_node_inner(&mut self, v: &Value, path: &str) -> Result<CnodeId, CompileError> {
        let obj = match v {
            Value::Bool(true) => return Ok(self.valid()),
            Value::Bool(false) => return Ok(self.invalid()),
            Value::Object(obj) => obj,
            _ => return Err(malformed(path, "schema must be an object or boolean")),
        };

        for key in obj.keys() {
            let key = key.as_str();
            if UNSUPPORTED.contains(&key) {
                return Err(CompileError::UnsupportedKeyword {
                    path: path.to_string(),
                    keyword: key.to_string(),
                });
            }
            if !KNOWN.contains(&key) && !IGNORED.contains(&key) {
                tracing::debug!(path, keyword = key, "ignoring unknown keyword");
            }
        }

        // definitions are translated for reachability even though they
        // add no constraint at this location.
        if let Some(defs) = obj.get("definitions") {
            let defs = expect_object(defs, path, "definitions")?;
            let base = child_path(path, "definitions");
            for (name, sub) in defs {
                let sub_path = child_path(&base, name);
                self.schema_node(sub, &sub_path)?;
            }
        }

        // $ref replaces the rest of the subschema.
        if let Some(target) = obj.get("$ref") {
            let target = expect_str(target, path, "$ref")?.to_string();
            let node = self.alloc(Cnode::Ref(target.clone()));
            self.pending_refs.push((node, target, path.to_string()));
            self.register_id(obj, path, node)?;
            return Ok(node);
        }

        let node = self.keywords_node(obj, path)?;
        self.register_id(obj, path, node)?;
        Ok(node)
    }

    fn register_id(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        path: &str,
        node: CnodeId,
    ) -> Result<(), CompileError> {
        if let Some(id) = obj.get("$id") {
            let id = expect_str(id, path, "$id")?;
            self.all_ids.insert(id.to_string(), node);
        }
        Ok(())
    }

    /// Lower the constraint keywords of one schema object.
    fn keywords_node(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        path: &str,
    ) -> Result<CnodeId, CompileError> {
        let types = self.declared_types(obj, path)?;

        let mut number: Vec<CnodeId> = Vec::new();
        let mut string: Vec<CnodeId> = Vec::new();
        let mut object: Vec<CnodeId> = Vec::new();
        let mut array: Vec<CnodeId> = Vec::new();

        self.number_keywords(obj, path, &mut number)?;
        self.string_keywords(obj, path, &mut string)?;
        self.object_keywords(obj, path, &mut object)?;
        self.array_keywords(obj, path, &mut array)?;

        let switch = self.build_switch(&types, number, string, object, array);

        let mut top: Vec<CnodeId> = vec![switch];
        self.combinator_keywords(obj, path, &mut top)?;

        Ok(if top.len() == 1 {
            top[0]
        } else {
            self.alloc(Cnode::And(CnodeList::from_vec(top)))
        })
    }

    fn declared_types(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        path: &str,
    ) -> Result<Option<BTreeSet<&'static str>>, CompileError> {
        let Some(t) = obj.get("type") else {
            return Ok(None);
        };
        let names: Vec<&str> = match t {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => {
                let mut names = Vec::with_capacity(items.len());
                for item in items {
                    names.push(expect_str(item, path, "type entry")?);
                }
                names
            }
            _ => return Err(malformed(path, "type must be a string or array of strings")),
        };
        let mut set = BTreeSet::new();
        for name in names {
            let canonical = match name {
                "null" => "null",
                "boolean" => "boolean",
                "object" => "object",
                "array" => "array",
                "number" => "number",
                "integer" => "integer",
                "string" => "string",
                other => {
                    return Err(malformed(path, format!("unknown type {other:?}")));
                }
            };
            set.insert(canonical);
        }
        Ok(Some(set))
    }

    fn number_keywords(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        path: &str,
        out: &mut Vec<CnodeId>,
    ) -> Result<(), CompileError> {
        let mut flags = RangeFlags::empty();
        let mut min = 0.0f64;
        let mut max = 0.0f64;

        if let Some(v) = obj.get("minimum") {
            min = expect_f64(v, path, "minimum")?;
            flags |= RangeFlags::MIN;
        }
        if let Some(v) = obj.get("maximum") {
            max = expect_f64(v, path, "maximum")?;
            flags |= RangeFlags::MAX;
        }

        // Boolean form modifies minimum/maximum; number form (draft 6)
        // is a standalone exclusive bound.
        match obj.get("exclusiveMinimum") {
            Some(Value::Bool(b)) => {
                if *b {
                    if !flags.contains(RangeFlags::MIN) {
                        return Err(malformed(path, "exclusiveMinimum requires minimum"));
                    }
                    flags |= RangeFlags::EXCL_MIN;
                }
            }
            Some(v) => {
                let bound = expect_f64(v, path, "exclusiveMinimum")?;
                if flags.contains(RangeFlags::MIN) {
                    if bound >= min {
                        min = bound;
                        flags |= RangeFlags::EXCL_MIN;
                    }
                } else {
                    min = bound;
                    flags |= RangeFlags::MIN | RangeFlags::EXCL_MIN;
                }
            }
            None => {}
        }
        match obj.get("exclusiveMaximum") {
            Some(Value::Bool(b)) => {
                if *b {
                    if !flags.contains(RangeFlags::MAX) {
                        return Err(malformed(path, "exclusiveMaximum requires maximum"));
                    }
                    flags |= RangeFlags::EXCL_MAX;
                }
            }
            Some(v) => {
                let bound = expect_f64(v, path, "exclusiveMaximum")?;
                if flags.contains(RangeFlags::MAX) {
                    if bound <= max {
                        max = bound;
                        flags |= RangeFlags::EXCL_MAX;
                    }
                } else {
                    max = bound;
                    flags |= RangeFlags::MAX | RangeFlags::EXCL_MAX;
                }
            }
            None => {}
        }

        if !flags.is_empty() {
            out.push(self.alloc(Cnode::NumRange(NumRange { flags, min, max })));
        }

        if let Some(v) = obj.get("multipleOf") {
            let divisor = expect_f64(v, path, "multipleOf")?;
            if divisor <= 0.0 {
                return Err(malformed(path, "multipleOf must be positive"));
            }
            out.push(self.alloc(Cnode::NumMultipleOf(divisor)));
        }
        Ok(())
    }

    fn string_keywords(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        path: &str,
        out: &mut Vec<CnodeId>,
    ) -> Result<(), CompileError> {
        let mut range: Option<CountRange> = None;
        if let Some(v) = obj.get("minLength") {
            let min = expect_count(v, path, "minLength")?;
            range = Some(CountRange::at_least(min));
        }
        if let Some(v) = obj.get("maxLength") {
            let max = expect_count(v, path, "maxLength")?;
            let min = range.map(|r| r.min).unwrap_or(0);
            range = Some(CountRange {
                min,
                max,
                upper: true,
            });
        }
        if let Some(r) = range {
            out.push(self.alloc(Cnode::CountRange(CountKind::Length, r)));
        }

        if let Some(v) = obj.get("pattern") {
            let pattern = expect_str(v, path, "pattern")?;
            check_pattern(pattern, &child_path(path, "pattern"))?;
            out.push(self.alloc(Cnode::StrMatch(MatchPattern::Search(pattern.to_string()))));
        }
        Ok(())
    }

    fn object_keywords(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        path: &str,
        out: &mut Vec<CnodeId>,
    ) -> Result<(), CompileError> {
        let mut entries: CnodeList = CnodeList::new();

        if let Some(v) = obj.get("properties") {
            let props = expect_object(v, path, "properties")?;
            let base = child_path(path, "properties");
            for (name, sub) in props {
                let sub_path = child_path(&base, name);
                let constraint = self.schema_node(sub, &sub_path)?;
                entries.push(self.alloc(Cnode::PropMatch {
                    pattern: MatchPattern::Literal(name.clone()),
                    constraint,
                }));
            }
        }
        if let Some(v) = obj.get("patternProperties") {
            let props = expect_object(v, path, "patternProperties")?;
            let base = child_path(path, "patternProperties");
            for (pattern, sub) in props {
                let sub_path = child_path(&base, pattern);
                check_pattern(pattern, &sub_path)?;
                let constraint = self.schema_node(sub, &sub_path)?;
                entries.push(self.alloc(Cnode::PropMatch {
                    pattern: MatchPattern::Search(pattern.clone()),
                    constraint,
                }));
            }
        }
        if let Some(v) = obj.get("additionalProperties") {
            let sub_path = child_path(path, "additionalProperties");
            let constraint = self.schema_node(v, &sub_path)?;
            entries.push(self.alloc(Cnode::PropDefault(constraint)));
        }
        if let Some(v) = obj.get("propertyNames") {
            let sub_path = child_path(path, "propertyNames");
            let constraint = self.schema_node(v, &sub_path)?;
            entries.push(self.alloc(Cnode::PropNames(constraint)));
        }
        if !entries.is_empty() {
            out.push(self.alloc(Cnode::PropSet(entries)));
        }

        if let Some(v) = obj.get("required") {
            let names = expect_array(v, path, "required")?;
            let mut set = BTreeSet::new();
            for name in names {
                set.insert(expect_str(name, path, "required entry")?.to_string());
            }
            out.push(self.alloc(Cnode::Required(set)));
        }

        let mut range: Option<CountRange> = None;
        if let Some(v) = obj.get("minProperties") {
            range = Some(CountRange::at_least(expect_count(v, path, "minProperties")?));
        }
        if let Some(v) = obj.get("maxProperties") {
            let max = expect_count(v, path, "maxProperties")?;
            let min = range.map(|r| r.min).unwrap_or(0);
            range = Some(CountRange {
                min,
                max,
                upper: true,
            });
        }
        if let Some(r) = range {
            out.push(self.alloc(Cnode::CountRange(CountKind::Props, r)));
        }

        if let Some(v) = obj.get("dependencies") {
            let deps = expect_object(v, path, "dependencies")?;
            let base = child_path(path, "dependencies");
            for (trigger, dep) in deps {
                let dep_path = child_path(&base, trigger);
                out.push(self.dependency(trigger, dep, &dep_path)?);
            }
        }
        Ok(())
    }

    /// One `dependencies` entry, in its canonical OR form: either the
    /// trigger is absent, or the dependency holds.
    fn dependency(
        &mut self,
        trigger: &str,
        dep: &Value,
        path: &str,
    ) -> Result<CnodeId, CompileError> {
        // PROP_SET{trigger -> INVALID}: valid exactly when the trigger
        // property never appears.
        let invalid = self.invalid();
        let absent_entry = self.alloc(Cnode::PropMatch {
            pattern: MatchPattern::Literal(trigger.to_string()),
            constraint: invalid,
        });
        let absent = self.alloc(Cnode::PropSet(CnodeList::from_slice(&[absent_entry])));

        let present = match dep {
            Value::Array(names) => {
                let mut set = BTreeSet::new();
                set.insert(trigger.to_string());
                for name in names {
                    set.insert(expect_str(name, path, "dependency entry")?.to_string());
                }
                self.alloc(Cnode::Required(set))
            }
            _ => {
                let mut set = BTreeSet::new();
                set.insert(trigger.to_string());
                let required = self.alloc(Cnode::Required(set));
                let sub = self.schema_node(dep, path)?;
                let sub_obj = self.object_part(sub)?;
                self.alloc(Cnode::And(CnodeList::from_slice(&[required, sub_obj])))
            }
        };

        Ok(self.alloc(Cnode::Or(CnodeList::from_slice(&[present, absent]))))
    }

    /// Project a lowered subschema onto its object-applicable part,
    /// for constraints that live inside an object switch slot.
    fn object_part(&mut self, id: CnodeId) -> Result<CnodeId, CompileError> {
        let node = self.arena[id].clone();
        Ok(match node {
            Cnode::Switch(slots) => slots[EventKind::ObjectBeg.switch_slot().unwrap()],
            Cnode::And(kids) => {
                let kids = self.object_part_list(kids)?;
                self.alloc(Cnode::And(kids))
            }
            Cnode::Or(kids) => {
                let kids = self.object_part_list(kids)?;
                self.alloc(Cnode::Or(kids))
            }
            Cnode::Xor(kids) => {
                let kids = self.object_part_list(kids)?;
                self.alloc(Cnode::Xor(kids))
            }
            Cnode::Not(k) => {
                let k = self.object_part(k)?;
                self.alloc(Cnode::Not(k))
            }
            Cnode::Valid | Cnode::Invalid | Cnode::Ref(_) => id,
            other => {
                return Err(CompileError::Internal(format!(
                    "cannot project {other:?} onto an object slot"
                )))
            }
        })
    }

    fn object_part_list(&mut self, kids: CnodeList) -> Result<CnodeList, CompileError> {
        let mut out = CnodeList::new();
        for k in kids {
            out.push(self.object_part(k)?);
        }
        Ok(out)
    }

    fn array_keywords(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        path: &str,
        out: &mut Vec<CnodeId>,
    ) -> Result<(), CompileError> {
        match obj.get("items") {
            Some(Value::Array(tuple)) => {
                let base = child_path(path, "items");
                let mut items = Vec::with_capacity(tuple.len());
                for (i, sub) in tuple.iter().enumerate() {
                    let sub_path = index_path(&base, i);
                    items.push(self.schema_node(sub, &sub_path)?);
                }
                let additional = match obj.get("additionalItems") {
                    Some(sub) => {
                        let sub_path = child_path(path, "additionalItems");
                        Some(self.schema_node(sub, &sub_path)?)
                    }
                    None => None,
                };
                out.push(self.alloc(Cnode::ArrItem { items, additional }));
            }
            Some(sub) => {
                let sub_path = child_path(path, "items");
                let additional = self.schema_node(sub, &sub_path)?;
                out.push(self.alloc(Cnode::ArrItem {
                    items: Vec::new(),
                    additional: Some(additional),
                }));
            }
            None => {}
        }

        let mut range: Option<CountRange> = None;
        if let Some(v) = obj.get("minItems") {
            range = Some(CountRange::at_least(expect_count(v, path, "minItems")?));
        }
        if let Some(v) = obj.get("maxItems") {
            let max = expect_count(v, path, "maxItems")?;
            let min = range.map(|r| r.min).unwrap_or(0);
            range = Some(CountRange {
                min,
                max,
                upper: true,
            });
        }
        if let Some(r) = range {
            out.push(self.alloc(Cnode::CountRange(CountKind::Items, r)));
        }

        if let Some(v) = obj.get("uniqueItems") {
            if expect_bool(v, path, "uniqueItems")? {
                out.push(self.alloc(Cnode::ArrUnique));
            }
        }
        if let Some(v) = obj.get("contains") {
            let sub_path = child_path(path, "contains");
            let sub = self.schema_node(v, &sub_path)?;
            out.push(self.alloc(Cnode::ArrContains(sub)));
        }
        Ok(())
    }

    fn combinator_keywords(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        path: &str,
        top: &mut Vec<CnodeId>,
    ) -> Result<(), CompileError> {
        for (keyword, make) in [
            ("allOf", Cnode::And as fn(CnodeList) -> Cnode),
            ("anyOf", Cnode::Or as fn(CnodeList) -> Cnode),
            ("oneOf", Cnode::Xor as fn(CnodeList) -> Cnode),
        ] {
            if let Some(v) = obj.get(keyword) {
                let subs = expect_array(v, path, keyword)?;
                if subs.is_empty() {
                    return Err(malformed(path, format!("{keyword} must be non-empty")));
                }
                let base = child_path(path, keyword);
                let mut kids = CnodeList::new();
                for (i, sub) in subs.iter().enumerate() {
                    let sub_path = index_path(&base, i);
                    kids.push(self.schema_node(sub, &sub_path)?);
                }
                top.push(self.alloc(make(kids)));
            }
        }

        if let Some(v) = obj.get("not") {
            let sub_path = child_path(path, "not");
            let sub = self.schema_node(v, &sub_path)?;
            top.push(self.alloc(Cnode::Not(sub)));
        }

        if let Some(v) = obj.get("const") {
            let node = self.literal_equality(v, path, "const")?;
            top.push(node);
        }
        if let Some(v) = obj.get("enum") {
            let options = expect_array(v, path, "enum")?;
            if options.is_empty() {
                return Err(malformed(path, "enum must be non-empty"));
            }
            let mut kids = CnodeList::new();
            for option in options {
                kids.push(self.literal_equality(option, path, "enum")?);
            }
            top.push(self.alloc(Cnode::Or(kids)));
        }
        Ok(())
    }

    /// `const`/`enum` over a scalar: a type-gated switch whose active
    /// slot tests equality with the literal.
    fn literal_equality(
        &mut self,
        v: &Value,
        path: &str,
        keyword: &str,
    ) -> Result<CnodeId, CompileError> {
        let (kind, constraint) = match v {
            Value::Null => (EventKind::Null, None),
            Value::Bool(true) => (EventKind::True, None),
            Value::Bool(false) => (EventKind::False, None),
            Value::Number(n) => {
                let v = n.as_f64().ok_or_else(|| malformed(path, "bad number"))?;
                let eq = self.alloc(Cnode::NumRange(NumRange {
                    flags: RangeFlags::MIN | RangeFlags::MAX,
                    min: v,
                    max: v,
                }));
                (EventKind::Number, Some(eq))
            }
            Value::String(s) => {
                let eq = self.alloc(Cnode::StrMatch(MatchPattern::Literal(s.clone())));
                (EventKind::String, Some(eq))
            }
            Value::Array(_) | Value::Object(_) => {
                return Err(CompileError::UnsupportedKeyword {
                    path: path.to_string(),
                    keyword: format!("{keyword} over composite values"),
                });
            }
        };

        let mut slots = [CnodeId(0); SWITCH_KINDS];
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = if Some(i) == kind.switch_slot() {
                match constraint {
                    Some(c) => c,
                    None => self.valid(),
                }
            } else {
                self.invalid()
            };
        }
        Ok(self.alloc(Cnode::Switch(slots)))
    }

    fn build_switch(
        &mut self,
        types: &Option<BTreeSet<&'static str>>,
        number: Vec<CnodeId>,
        string: Vec<CnodeId>,
        object: Vec<CnodeId>,
        array: Vec<CnodeId>,
    ) -> CnodeId {
        let default_valid = types.is_none();

        let active = |name: &str| -> bool {
            match types {
                None => true,
                Some(set) => set.contains(name),
            }
        };
        let integer_only =
            matches!(types, Some(set) if set.contains("integer") && !set.contains("number"));

        let mut slots = [CnodeId(0); SWITCH_KINDS];
        for (i, slot) in slots.iter_mut().enumerate() {
            let kind = EventKind::from_switch_slot(i);
            let (slot_active, constraints) = match kind {
                EventKind::Null => (active("null"), Vec::new()),
                EventKind::True | EventKind::False => (active("boolean"), Vec::new()),
                EventKind::Number => {
                    let slot_active = active("number") || active("integer");
                    let mut constraints = number.clone();
                    if integer_only {
                        constraints.insert(0, self.alloc(Cnode::NumInteger));
                    }
                    (slot_active, constraints)
                }
                EventKind::String => (active("string"), string.clone()),
                EventKind::ObjectBeg => (active("object"), object.clone()),
                EventKind::ArrayBeg => (active("array"), array.clone()),
                // A value never starts with a closing token.
                EventKind::ObjectEnd | EventKind::ArrayEnd => (false, Vec::new()),
                EventKind::None => unreachable!("switch slots cover value kinds"),
            };

            *slot = if !slot_active {
                if default_valid && !kind.closes() {
                    self.valid()
                } else {
                    self.invalid()
                }
            } else if constraints.is_empty() {
                self.valid()
            } else if constraints.len() == 1 {
                constraints[0]
            } else {
                self.alloc(Cnode::And(CnodeList::from_vec(constraints)))
            };
        }
        self.alloc(Cnode::Switch(slots))
    }

    /// Resolve every `$ref` target to a canonical label and record it
    /// in `ref_ids`.
    fn resolve_refs(&mut self) -> Result<(), CompileError> {
        let pending = std::mem::take(&mut self.pending_refs);
        for (node, raw, _site) in pending {
            let canonical = self.resolve_target(&raw)?;
            if self.arena[node] != Cnode::Ref(canonical.clone()) {
                self.arena.replace(node, Cnode::Ref(canonical.clone()));
            }
            self.ref_ids.insert(canonical);
        }
        Ok(())
    }

    fn resolve_target(&self, raw: &str) -> Result<String, CompileError> {
        if raw == "#" {
            return Ok("#".to_string());
        }
        if let Some(rest) = raw.strip_prefix("#/") {
            // Normalize the pointer through unescape/re-escape so the
            // label matches the walk's labeling.
            let mut label = String::from("#");
            for seg in rest.split('/') {
                label = child_path(&label, &ptr_unescape(seg));
            }
            if self.all_ids.contains_key(&label) {
                return Ok(label);
            }
            return Err(CompileError::UnresolvedRef(raw.to_string()));
        }
        if self.all_ids.contains_key(raw) {
            return Ok(raw.to_string());
        }
        Err(CompileError::UnresolvedRef(raw.to_string()))
    }

    fn into_forest(self, root: CnodeId) -> CnodeForest {
        let Translator {
            arena,
            all_ids,
            ref_ids,
            ..
        } = self;

        let mut trees = vec![root];
        let mut tree_ids = IndexMap::new();
        tree_ids.insert("#".to_string(), 0);

        for label in &ref_ids {
            if tree_ids.contains_key(label) {
                continue;
            }
            let target = all_ids[label];
            if target == root {
                tree_ids.insert(label.clone(), 0);
            } else {
                trees.push(target);
                tree_ids.insert(label.clone(), trees.len() - 1);
            }
        }

        CnodeForest {
            arena,
            trees,
            all_ids,
            ref_ids,
            tree_ids,
        }
    }
}
