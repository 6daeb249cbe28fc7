//! Stage compiler.
//!
//! Renders a named stage document, splices in its includes, and turns the
//! declarations into an ordered list of [`Step`]s with dependency edges
//! pointing at earlier steps. Targeted state steps get their per-node file
//! rendered once so their sub-steps are known before the stage runs.
//!
//! Compilation is all-or-nothing: any failure discards the partial result.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use serde_yaml::Value as YamlValue;
use thiserror::Error;
use tracing::{debug, info};

use super::cache::RenderCache;
use crate::adapters::{RenderFailure, Rendered, Renderer};
use crate::domain::{
    CompiledStage, DeclarationKind, RunnerStep, StanzaKind, Step, StepKind, SubStep,
    SubStepCall, TargetedStep,
};

/// Requisite directives that make a step depend on another's success
const SUCCESS_DIRECTIVES: &[&str] = &["require", "watch", "onchanges"];

/// Requisite directive that makes a step depend on another's failure
const FAILURE_DIRECTIVE: &str = "onfail";

/// Top-level keys of a state file that are not stanzas
const NON_STANZA_KEYS: &[&str] = &["include", "exclude", "extend"];

/// Stanzas that execute directly on the node rather than declaring state
const EXECUTION_STANZAS: &[&str] = &[
    "module.run",
    "module.wait",
    "cmd.run",
    "cmd.script",
    "cmd.wait",
    "file.managed",
    "file.recurse",
    "pkg.installed",
    "pkg.latest",
];

/// Errors that abort a compile
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("Failed to render stage {stage_name}: {}", .errors.join("; "))]
    StageRender {
        stage_name: String,
        errors: Vec<String>,
    },

    #[error("Failed to render state {state} on {node}: {}", .errors.join("; "))]
    StateRender {
        node: String,
        state: String,
        errors: Vec<String>,
    },

    #[error("Step '{step}' has {directive} on '{reference}', which {problem}")]
    UnknownReference {
        step: String,
        directive: String,
        reference: String,
        problem: ReferenceProblem,
    },

    #[error("Invalid declaration '{description}': {reason}")]
    InvalidDeclaration { description: String, reason: String },
}

/// Why a requisite reference could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceProblem {
    /// Names a declaration that appears later in the document
    DeclaredLater,
    Missing,
}

impl std::fmt::Display for ReferenceProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeclaredLater => write!(f, "is declared later"),
            Self::Missing => write!(f, "does not exist"),
        }
    }
}

impl CompileError {
    /// Human-readable messages for display
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::StageRender { errors, .. } | Self::StateRender { errors, .. } => errors.clone(),
            other => vec![other.to_string()],
        }
    }

    fn stage(stage_name: &str, failure: RenderFailure) -> Self {
        Self::StageRender {
            stage_name: stage_name.to_string(),
            errors: failure.errors,
        }
    }

    fn invalid(description: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDeclaration {
            description: description.to_string(),
            reason: reason.into(),
        }
    }
}

/// Knobs for a compile
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Keep state steps opaque: do not render their per-node files
    pub hide_state_steps: bool,

    /// Drop sub-steps that will not report a sub-result
    pub only_visible_steps: bool,
}

/// A compiled stage together with the renderer's output text
#[derive(Debug, Clone)]
pub struct Compiled {
    pub stage: CompiledStage,
    pub output: String,
}

/// One stage declaration after splicing, before it becomes a step
#[derive(Debug, Clone)]
struct Declaration {
    description: String,
    kind: DeclarationKind,
    args: Map<String, JsonValue>,
}

impl Declaration {
    fn arg_str(&self, key: &str) -> Option<String> {
        self.args.get(key).and_then(joined_str)
    }

    /// Function a runner or function declaration calls
    fn function(&self) -> String {
        self.arg_str("name")
            .unwrap_or_else(|| self.description.clone())
    }

    /// Whether a requisite entry `{module: id}` (or a bare `id`) names this
    fn matches_reference(&self, module: Option<&str>, id: &str) -> bool {
        let module_ok = match module {
            None | Some("salt") => true,
            Some(module) => {
                self.kind == DeclarationKind::Function
                    && self
                        .function()
                        .strip_prefix(module)
                        .is_some_and(|rest| rest.starts_with('.'))
            }
        };
        module_ok && (self.description == id || self.arg_str("name").as_deref() == Some(id))
    }
}

/// Compiles stage documents into steps
pub struct StageCompiler {
    renderer: Arc<dyn Renderer>,
    cache: Arc<RenderCache>,
}

impl StageCompiler {
    pub fn new(renderer: Arc<dyn Renderer>, cache: Arc<RenderCache>) -> Self {
        Self { renderer, cache }
    }

    pub fn cache(&self) -> &Arc<RenderCache> {
        &self.cache
    }

    /// Compile a stage by name
    pub async fn compile_stage(
        &self,
        stage_name: &str,
        options: CompileOptions,
    ) -> Result<Compiled, CompileError> {
        info!(
            stage = stage_name,
            renderer = self.renderer.name(),
            hide_state_steps = options.hide_state_steps,
            only_visible_steps = options.only_visible_steps,
            "Compiling stage"
        );

        let mut declarations = Vec::new();
        let mut output = String::new();
        let mut visiting = Vec::new();
        self.collect_declarations(stage_name, &mut visiting, &mut declarations, &mut output)
            .await?;

        let mut steps: Vec<Arc<Step>> = Vec::with_capacity(declarations.len());
        for (index, declaration) in declarations.iter().enumerate() {
            let (on_success_deps, on_failure_deps) =
                resolve_requisites(index, declaration, &declarations, &steps)?;

            let kind = self.build_kind(declaration, options).await?;

            debug!(
                order = index + 1,
                description = %declaration.description,
                kind = declaration.kind.label(),
                "Compiled step"
            );

            steps.push(Arc::new(Step {
                index,
                description: declaration.description.clone(),
                declared_as: declaration.kind,
                kind,
                on_success_deps,
                on_failure_deps,
            }));
        }

        info!(stage = stage_name, steps = steps.len(), "Stage compiled");

        Ok(Compiled {
            stage: CompiledStage {
                name: stage_name.to_string(),
                steps,
            },
            output,
        })
    }

    /// Render a stage document and append its declarations, following includes
    fn collect_declarations<'a>(
        &'a self,
        stage_name: &'a str,
        visiting: &'a mut Vec<String>,
        declarations: &'a mut Vec<Declaration>,
        output: &'a mut String,
    ) -> Pin<Box<dyn Future<Output = Result<(), CompileError>> + Send + 'a>> {
        Box::pin(async move {
            if visiting.iter().any(|v| v == stage_name) {
                let mut chain = visiting.clone();
                chain.push(stage_name.to_string());
                return Err(CompileError::StageRender {
                    stage_name: stage_name.to_string(),
                    errors: vec![format!("include cycle: {}", chain.join(" -> "))],
                });
            }

            let rendered = self.render_stage_cached(stage_name).await?;
            if !rendered.output.is_empty() {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&rendered.output);
            }

            let YamlValue::Mapping(document) = rendered.document else {
                return Err(CompileError::StageRender {
                    stage_name: stage_name.to_string(),
                    errors: vec!["rendered document is not a mapping".to_string()],
                });
            };

            visiting.push(stage_name.to_string());
            for (key, body) in &document {
                let description = key_string(key);

                if description == "include" {
                    for include in include_names(body) {
                        let resolved = resolve_include(stage_name, &include, |name| {
                            self.renderer.is_package(name)
                        });
                        debug!(parent = stage_name, include = %include, resolved = %resolved, "Following include");
                        self.collect_declarations(&resolved, visiting, declarations, output)
                            .await?;
                    }
                    continue;
                }

                declarations.extend(parse_declaration(&description, body)?);
            }
            visiting.pop();

            Ok(())
        })
    }

    async fn render_stage_cached(&self, stage_name: &str) -> Result<Rendered, CompileError> {
        if let Some(rendered) = self.cache.get(stage_name, None) {
            debug!(stage = stage_name, "Stage render found in cache");
            return Ok(rendered);
        }

        let rendered = self
            .renderer
            .render_stage(stage_name)
            .await
            .map_err(|failure| CompileError::stage(stage_name, failure))?;
        self.cache.insert(stage_name, None, rendered.clone());
        Ok(rendered)
    }

    async fn render_state_cached(
        &self,
        state_name: &str,
        target: &str,
    ) -> Result<Rendered, CompileError> {
        if let Some(rendered) = self.cache.get(state_name, Some(target)) {
            debug!(state = state_name, target, "State render found in cache");
            return Ok(rendered);
        }

        let rendered = self
            .renderer
            .render_state(state_name, target)
            .await
            .map_err(|failure| CompileError::StateRender {
                node: failure.node.unwrap_or_else(|| target.to_string()),
                state: state_name.to_string(),
                errors: failure.errors,
            })?;
        self.cache.insert(state_name, Some(target), rendered.clone());
        Ok(rendered)
    }

    async fn build_kind(
        &self,
        declaration: &Declaration,
        options: CompileOptions,
    ) -> Result<StepKind, CompileError> {
        let args = JsonValue::Object(declaration.args.clone());

        match declaration.kind {
            DeclarationKind::Runner => Ok(StepKind::Runner(RunnerStep {
                function: declaration.function(),
                args,
            })),
            DeclarationKind::Function => match declaration.arg_str("tgt") {
                Some(target) => Ok(StepKind::Targeted(TargetedStep {
                    reference_name: declaration.function(),
                    declared_target_selector: target,
                    args,
                    sub_steps: Vec::new(),
                })),
                None => Ok(StepKind::Runner(RunnerStep {
                    function: declaration.function(),
                    args,
                })),
            },
            DeclarationKind::State => {
                let reference_name = declaration
                    .arg_str("sls")
                    .or_else(|| declaration.arg_str("name"))
                    .ok_or_else(|| {
                        CompileError::invalid(&declaration.description, "state without sls")
                    })?;
                let target = declaration.arg_str("tgt").ok_or_else(|| {
                    CompileError::invalid(&declaration.description, "state without tgt")
                })?;

                let mut sub_steps = Vec::new();
                if !options.hide_state_steps {
                    for state in reference_name.split(',').map(str::trim).filter(|s| !s.is_empty())
                    {
                        let rendered = self.render_state_cached(state, &target).await?;
                        sub_steps.extend(parse_sub_steps(
                            &rendered.document,
                            options.only_visible_steps,
                        ));
                    }
                }

                Ok(StepKind::Targeted(TargetedStep {
                    reference_name,
                    declared_target_selector: target,
                    args,
                    sub_steps,
                }))
            }
        }
    }
}

/// Parse one top-level stage entry into its declarations
fn parse_declaration(description: &str, body: &YamlValue) -> Result<Vec<Declaration>, CompileError> {
    let YamlValue::Mapping(markers) = body else {
        return Err(CompileError::invalid(
            description,
            "expected a mapping of declaration marker to arguments",
        ));
    };

    let mut declarations = Vec::new();
    for (marker, args) in markers {
        let marker = key_string(marker);
        if marker.starts_with("__") {
            continue;
        }
        let kind = DeclarationKind::from_marker(&marker).ok_or_else(|| {
            CompileError::invalid(description, format!("unknown marker '{}'", marker))
        })?;

        let (args, _) = merge_args(args);
        declarations.push(Declaration {
            description: description.to_string(),
            kind,
            args,
        });
    }

    if declarations.is_empty() {
        return Err(CompileError::invalid(description, "no declaration marker"));
    }
    Ok(declarations)
}

type Requisites = (Vec<Arc<Step>>, Vec<Arc<Step>>);

/// Resolve a declaration's requisites against the steps built so far
fn resolve_requisites(
    index: usize,
    declaration: &Declaration,
    declarations: &[Declaration],
    built: &[Arc<Step>],
) -> Result<Requisites, CompileError> {
    let mut on_success = Vec::new();
    let mut on_failure = Vec::new();

    let directives = SUCCESS_DIRECTIVES
        .iter()
        .copied()
        .chain(std::iter::once(FAILURE_DIRECTIVE));

    for directive in directives {
        let Some(value) = declaration.args.get(directive) else {
            continue;
        };

        for (module, id) in requisite_entries(value) {
            let reference = match &module {
                Some(module) => format!("{}: {}", module, id),
                None => id.clone(),
            };

            let position = declarations
                .iter()
                .position(|d| d.matches_reference(module.as_deref(), &id));

            let step = match position {
                Some(pos) if pos < index => &built[pos],
                found => {
                    return Err(CompileError::UnknownReference {
                        step: declaration.description.clone(),
                        directive: directive.to_string(),
                        reference,
                        problem: if found.is_some() {
                            ReferenceProblem::DeclaredLater
                        } else {
                            ReferenceProblem::Missing
                        },
                    })
                }
            };

            let deps = if directive == FAILURE_DIRECTIVE {
                &mut on_failure
            } else {
                &mut on_success
            };
            if !deps.iter().any(|d: &Arc<Step>| Arc::ptr_eq(d, step)) {
                deps.push(step.clone());
            }
        }
    }

    Ok((on_success, on_failure))
}

/// Flatten a requisite value into `(module, id)` pairs
fn requisite_entries(value: &JsonValue) -> Vec<(Option<String>, String)> {
    let items: Vec<&JsonValue> = match value {
        JsonValue::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut entries = Vec::new();
    for item in items {
        match item {
            JsonValue::String(id) => entries.push((None, id.clone())),
            JsonValue::Object(map) => {
                for (module, id) in map {
                    if let Some(id) = joined_str(id) {
                        entries.push((Some(module.clone()), id));
                    }
                }
            }
            JsonValue::Null => {}
            other => entries.push((None, other.to_string())),
        }
    }
    entries
}

/// Names listed under an `include` key
fn include_names(body: &YamlValue) -> Vec<String> {
    let items: Vec<&YamlValue> = match body {
        YamlValue::Sequence(items) => items.iter().collect(),
        other => vec![other],
    };

    items
        .into_iter()
        .filter_map(|item| match item {
            YamlValue::String(s) => Some(s.clone()),
            YamlValue::Mapping(map) => map.keys().next().map(key_string),
            _ => None,
        })
        .collect()
}

/// Resolve an include relative to the including stage.
///
/// Leading dots climb from the parent: `.x` is a sibling inside the
/// parent's package, each further dot climbs one level. A parent that is a
/// plain file (not a package) loses its own last component first. Names
/// without leading dots are absolute.
pub fn resolve_include(parent: &str, include: &str, is_package: impl Fn(&str) -> bool) -> String {
    let dots = include.chars().take_while(|c| *c == '.').count();
    if dots == 0 {
        return include.to_string();
    }
    let rest = &include[dots..];

    let mut climb = dots - 1;
    if !is_package(parent) {
        climb += 1;
    }

    let components: Vec<&str> = parent.split('.').collect();
    let keep = components.len().saturating_sub(climb);
    let base = components[..keep].join(".");

    if base.is_empty() {
        rest.to_string()
    } else {
        format!("{}.{}", base, rest)
    }
}

/// Parse the stanzas of a rendered per-node state file into sub-steps
pub fn parse_sub_steps(document: &YamlValue, only_visible: bool) -> Vec<SubStep> {
    let YamlValue::Mapping(stanzas) = document else {
        return Vec::new();
    };

    let mut sub_steps = Vec::new();
    for (key, body) in stanzas {
        let description = key_string(key);
        if NON_STANZA_KEYS.contains(&description.as_str()) || description.starts_with("__") {
            continue;
        }
        let YamlValue::Mapping(calls) = body else {
            continue;
        };

        for (call_key, args) in calls {
            let call_key = key_string(call_key);
            if call_key.starts_with("__") {
                continue;
            }
            let sub_step = build_sub_step(&description, &call_key, args);
            if only_visible && !sub_step.visible {
                continue;
            }
            sub_steps.push(sub_step);
        }
    }
    sub_steps
}

fn build_sub_step(description: &str, call_key: &str, args: &YamlValue) -> SubStep {
    let (args, positionals) = merge_args(args);
    let visible = match args.get("fire_event") {
        None => true,
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Null) => false,
        Some(_) => true,
    };

    if call_key == "module.run" {
        // Old syntax names the function in `name`, new syntax uses it as a key
        let function = args
            .get("name")
            .and_then(JsonValue::as_str)
            .map(String::from)
            .or_else(|| args.keys().find(|k| k.contains('.')).cloned())
            .unwrap_or_else(|| call_key.to_string());
        return SubStep {
            description: description.to_string(),
            function,
            call: SubStepCall::ExecutionCall,
            stanza: StanzaKind::ModuleRun,
            args,
            visible,
        };
    }

    // `pkg: [installed, ...]` short form names the state function positionally
    let function = if call_key.contains('.') {
        call_key.to_string()
    } else {
        match positionals.first() {
            Some(fun) => format!("{}.{}", call_key, fun),
            None => call_key.to_string(),
        }
    };
    let call = if EXECUTION_STANZAS.contains(&function.as_str()) {
        SubStepCall::ExecutionCall
    } else {
        SubStepCall::StateCall
    };

    SubStep {
        description: description.to_string(),
        function,
        call,
        stanza: StanzaKind::BuiltIn,
        args,
        visible,
    }
}

/// Merge a list of single-key argument mappings into one map.
/// Bare strings in the list are returned separately, in order.
fn merge_args(args: &YamlValue) -> (Map<String, JsonValue>, Vec<String>) {
    let mut merged = Map::new();
    let mut positionals = Vec::new();

    let mut absorb = |item: &YamlValue| match item {
        YamlValue::Mapping(map) => {
            for (k, v) in map {
                merged.insert(key_string(k), to_json(v));
            }
        }
        YamlValue::String(s) => positionals.push(s.clone()),
        YamlValue::Null => {}
        other => positionals.push(key_string(other)),
    };

    match args {
        YamlValue::Sequence(items) => items.iter().for_each(&mut absorb),
        other => absorb(other),
    }

    (merged, positionals)
}

/// A string argument; lists of strings are joined with commas
fn joined_str(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(JsonValue::as_str).collect();
            (!parts.is_empty()).then(|| parts.join(","))
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn key_string(key: &YamlValue) -> String {
    match key {
        YamlValue::String(s) => s.clone(),
        YamlValue::Bool(b) => b.to_string(),
        YamlValue::Number(n) => n.to_string(),
        YamlValue::Null => "null".to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

fn to_json(value: &YamlValue) -> JsonValue {
    match value {
        YamlValue::Null => JsonValue::Null,
        YamlValue::Bool(b) => JsonValue::Bool(*b),
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                JsonValue::from(i)
            } else if let Some(u) = n.as_u64() {
                JsonValue::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            }
        }
        YamlValue::String(s) => JsonValue::String(s.clone()),
        YamlValue::Sequence(items) => JsonValue::Array(items.iter().map(to_json).collect()),
        YamlValue::Mapping(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (key_string(k), to_json(v)))
                .collect(),
        ),
        YamlValue::Tagged(tagged) => to_json(&tagged.value),
    }
}
