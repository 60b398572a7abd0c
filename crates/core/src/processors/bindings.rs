//! Typed contract bindings generated from ABI

use super::{existing_outputs, generated_marker, resolve_dir, PostProcessor, ProcessContext};
use crate::artifacts::{abi, writer, Abi};
use crate::utils::write_atomic;
use convert_case::{Case, Casing};
use eyre::{Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Binding flavour to emit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindingTarget {
    /// Solidity `interface` per contract
    Solidity,
    /// TypeScript interface and connect helper for ethers v5
    #[default]
    EthersV5,
}

impl BindingTarget {
    fn extension(self) -> &'static str {
        match self {
            Self::Solidity => "sol",
            Self::EthersV5 => "ts",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingsConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_order")]
    pub order: i32,
    #[serde(default = "default_run_on_build")]
    pub run_on_build: bool,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default)]
    pub target: BindingTarget,
}

fn default_order() -> i32 {
    10
}

fn default_run_on_build() -> bool {
    true
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("typechain")
}

#[derive(Debug)]
pub struct TypeBindingGenerator {
    name: String,
    order: i32,
    run_on_build: bool,
    out_dir: PathBuf,
    target: BindingTarget,
}

impl TypeBindingGenerator {
    pub fn new(name: String, config: BindingsConfig, project_root: &Path) -> Self {
        Self {
            name,
            order: config.order,
            run_on_build: config.run_on_build,
            out_dir: resolve_dir(project_root, &config.out_dir),
            target: config.target,
        }
    }
}

impl PostProcessor for TypeBindingGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn run_on_build(&self) -> bool {
        self.run_on_build
    }

    fn output_location(&self) -> &Path {
        &self.out_dir
    }

    fn process(&self, ctx: &ProcessContext<'_>) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        let mut seen: HashMap<String, String> = HashMap::new();

        for artifact in ctx.artifacts.snapshot() {
            for contract in artifact.contracts.values() {
                if contract.abi.is_empty() {
                    continue;
                }
                if let Some(first) = seen.get(&contract.name) {
                    let warning = format!(
                        "{}: no binding for {} in {}, the name is already bound to {}",
                        self.name, contract.name, artifact.unit, first
                    );
                    tracing::warn!("{}", warning);
                    ctx.artifacts.record_warning(warning);
                    continue;
                }
                seen.insert(contract.name.clone(), artifact.unit.clone());

                let text = match self.target {
                    BindingTarget::Solidity => solidity_interface(
                        &contract.name,
                        &artifact.compiler_version,
                        &contract.abi,
                        &artifact.unit,
                    ),
                    BindingTarget::EthersV5 => {
                        typescript_binding(&contract.name, &contract.abi, &artifact.unit)?
                    }
                };

                let path = self
                    .out_dir
                    .join(format!("{}.{}", contract.name, self.target.extension()));
                write_atomic(&path, text.as_bytes())
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                written.push(path);
            }
        }

        // Bindings of units that failed to compile stay until they build again
        let retained: BTreeSet<&str> = ctx.retained_units().into_iter().collect();
        let mut keep: BTreeSet<PathBuf> = written.iter().cloned().collect();
        keep.extend(
            existing_outputs(&self.out_dir)
                .into_iter()
                .filter(|(_, unit)| unit.as_deref().is_some_and(|u| retained.contains(u)))
                .map(|(path, _)| path),
        );
        writer::reconcile(&self.out_dir, &keep, &[])?;
        Ok(written)
    }
}

/// Generates a Solidity interface from contract ABI
pub fn solidity_interface(contract: &str, version: &Version, abi: &Abi, unit: &str) -> String {
    let style = SolidityStyle::for_version(version);
    let mut interface = String::new();

    // Header
    interface.push_str("// SPDX-License-Identifier: MIT\n");
    interface.push_str(&format!("// {}\n", generated_marker(unit)));
    interface.push_str(&format!("pragma solidity ^{version};\n"));

    // Extract struct definitions
    let mut seen_structs = HashSet::new();
    let mut struct_definitions = Vec::new();
    for entry in abi::entries(abi, "function").chain(abi::entries(abi, "event")) {
        for key in ["inputs", "outputs"] {
            if let Some(params) = entry.get(key).and_then(Value::as_array) {
                collect_structs(params, &mut seen_structs, &mut struct_definitions);
            }
        }
    }
    if !struct_definitions.is_empty() && style.needs_abi_coder_v2 {
        interface.push_str("pragma experimental ABIEncoderV2;\n");
    }
    interface.push_str(&format!("\ninterface I{} {{\n", contract.to_case(Case::Pascal)));

    let mut sections = struct_definitions;
    let events: Vec<String> = abi::entries(abi, "event").map(format_event).collect();
    if !events.is_empty() {
        sections.push(events.join("\n"));
    }
    let functions: Vec<String> = abi::entries(abi, "function")
        .map(|f| format_function(f, &style))
        .collect();
    if !functions.is_empty() {
        sections.push(functions.join("\n"));
    }

    if !sections.is_empty() {
        interface.push_str(&sections.join("\n\n"));
        interface.push('\n');
    }
    interface.push_str("}\n");
    interface
}

/// Syntax differences between compiler generations
struct SolidityStyle {
    data_locations: bool,
    view_keyword: bool,
    needs_abi_coder_v2: bool,
}

impl SolidityStyle {
    fn for_version(version: &Version) -> Self {
        Self {
            data_locations: *version >= Version::new(0, 5, 0),
            view_keyword: *version >= Version::new(0, 4, 17),
            needs_abi_coder_v2: *version < Version::new(0, 8, 0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DataLocation {
    Memory,
    Calldata,
}

fn format_function(func: &Value, style: &SolidityStyle) -> String {
    let name = func["name"].as_str().unwrap_or_default();
    let empty_vec = Vec::new();
    let inputs = func["inputs"].as_array().unwrap_or(&empty_vec);
    let outputs = func["outputs"].as_array().unwrap_or(&empty_vec);

    let location = |loc| style.data_locations.then_some(loc);
    let params = inputs
        .iter()
        .map(|p| format_parameter(p, location(DataLocation::Calldata)))
        .collect::<Vec<_>>()
        .join(", ");

    let returns = if outputs.is_empty() {
        String::new()
    } else {
        let ret_params = outputs
            .iter()
            .map(|p| format_parameter(p, location(DataLocation::Memory)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(" returns ({ret_params})")
    };

    let mut_str = match state_mutability(func) {
        "pure" if style.view_keyword => " pure",
        "view" if style.view_keyword => " view",
        "pure" | "view" => " constant",
        "payable" => " payable",
        _ => "",
    };

    format!("    function {name}({params}) external{mut_str}{returns};")
}

/// `stateMutability`, falling back to the pre-0.4.16 `constant`/`payable` flags
fn state_mutability(func: &Value) -> &str {
    if let Some(mutability) = func["stateMutability"].as_str() {
        return mutability;
    }
    if func["constant"].as_bool() == Some(true) {
        "view"
    } else if func["payable"].as_bool() == Some(true) {
        "payable"
    } else {
        "nonpayable"
    }
}

fn format_event(event: &Value) -> String {
    let name = event["name"].as_str().unwrap_or_default();
    let params = event["inputs"]
        .as_array()
        .map(|inputs| {
            inputs
                .iter()
                .map(|p| {
                    let ty = format_sol_type(p);
                    let indexed = if p["indexed"].as_bool() == Some(true) {
                        " indexed"
                    } else {
                        ""
                    };
                    match p["name"].as_str().filter(|n| !n.is_empty()) {
                        Some(n) => format!("{ty}{indexed} {n}"),
                        None => format!("{ty}{indexed}"),
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();
    let anonymous = if event["anonymous"].as_bool() == Some(true) {
        " anonymous"
    } else {
        ""
    };
    format!("    event {name}({params}){anonymous};")
}

fn format_parameter(param: &Value, location: Option<DataLocation>) -> String {
    let name = param["name"].as_str().unwrap_or("");
    let ty = format_sol_type(param);

    let location_str = match location.filter(|_| is_reference_type(param)) {
        Some(DataLocation::Memory) => " memory",
        Some(DataLocation::Calldata) => " calldata",
        None => "",
    };

    if name.is_empty() {
        format!("{ty}{location_str}")
    } else {
        format!("{ty}{location_str} {name}")
    }
}

fn is_reference_type(param: &Value) -> bool {
    let ty = param["type"].as_str().unwrap_or_default();
    ty == "string" || ty == "bytes" || ty.ends_with(']') || ty.starts_with("tuple")
}

/// Struct name from `internalType`, e.g. `struct Vault.Order[]` -> `Order`
fn struct_name(param: &Value) -> Option<&str> {
    let internal = param.get("internalType")?.as_str()?.strip_prefix("struct ")?;
    let base = internal.split('[').next().unwrap_or(internal);
    Some(base.rsplit('.').next().unwrap_or(base))
}

fn array_suffix(ty: &str) -> &str {
    ty.find('[').map(|i| &ty[i..]).unwrap_or("")
}

fn format_sol_type(param: &Value) -> String {
    let param_type = param["type"].as_str().unwrap_or("unknown");

    if !param_type.starts_with("tuple") {
        return param_type.to_string();
    }

    if let Some(name) = struct_name(param) {
        return format!("{name}{}", array_suffix(param_type));
    }

    // Anonymous tuple without internal type information
    abi::canonical_type(param)
}

fn collect_structs(params: &[Value], seen: &mut HashSet<String>, structs: &mut Vec<String>) {
    for param in params {
        let is_tuple = param["type"]
            .as_str()
            .map(|t| t.starts_with("tuple"))
            .unwrap_or(false);
        if !is_tuple {
            continue;
        }

        let Some(components) = param.get("components").and_then(Value::as_array) else {
            continue;
        };

        if let Some(struct_name) = struct_name(param) {
            if seen.insert(struct_name.to_string()) {
                let fields = components
                    .iter()
                    .map(|field| {
                        let field_name = field["name"].as_str().unwrap_or("_");
                        let field_type = format_sol_type(field);
                        format!("        {field_type} {field_name};")
                    })
                    .collect::<Vec<_>>()
                    .join("\n");

                structs.push(format!("    struct {struct_name} {{\n{fields}\n    }}"));
            }
        }

        // Nested structs
        collect_structs(components, seen, structs);
    }
}

/// Generates an ethers v5 TypeScript binding from contract ABI
pub fn typescript_binding(contract: &str, abi: &Abi, unit: &str) -> Result<String> {
    let type_name = contract.to_case(Case::Pascal);
    let abi_const = format!("{}_ABI", contract.to_case(Case::Snake).to_uppercase());
    let abi_json = serde_json::to_string_pretty(abi).context("Failed to serialize ABI")?;

    let mut overloads: BTreeMap<&str, usize> = BTreeMap::new();
    for func in abi::entries(abi, "function") {
        *overloads
            .entry(func["name"].as_str().unwrap_or_default())
            .or_default() += 1;
    }

    let methods: Vec<String> = abi::entries(abi, "function")
        .map(|func| {
            let name = func["name"].as_str().unwrap_or_default();
            let key = if overloads.get(name).copied().unwrap_or(0) > 1 {
                format!("\"{}\"", abi::signature(func).unwrap_or_default())
            } else {
                name.to_string()
            };
            format!("  {key}({}): Promise<{}>;", ts_params(func), ts_return(func))
        })
        .collect();

    let mut out = String::new();
    out.push_str(&format!("/* {} */\n", generated_marker(unit)));
    out.push_str("import type { BigNumber, BigNumberish, BytesLike, CallOverrides, ContractTransaction, Overrides, PayableOverrides, Signer, providers } from \"ethers\";\n");
    out.push_str("import { Contract } from \"ethers\";\n\n");
    out.push_str(&format!("export const {abi_const} = {abi_json} as const;\n\n"));
    out.push_str(&format!("export interface {type_name} extends Contract {{\n"));
    for method in methods {
        out.push_str(&method);
        out.push('\n');
    }
    out.push_str("}\n\n");
    out.push_str(&format!(
        "export function connect{type_name}(address: string, signerOrProvider: Signer | providers.Provider): {type_name} {{\n"
    ));
    out.push_str(&format!(
        "  return new Contract(address, {abi_const}, signerOrProvider) as {type_name};\n"
    ));
    out.push_str("}\n");
    Ok(out)
}

fn ts_params(func: &Value) -> String {
    let mut params: Vec<String> = func["inputs"]
        .as_array()
        .map(|inputs| {
            inputs
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let name = p["name"]
                        .as_str()
                        .filter(|n| !n.is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("arg{i}"));
                    format!("{name}: {}", ts_type(p, Direction::Input))
                })
                .collect()
        })
        .unwrap_or_default();

    let overrides = match state_mutability(func) {
        "view" | "pure" => "CallOverrides",
        "payable" => "PayableOverrides",
        _ => "Overrides",
    };
    params.push(format!("overrides?: {overrides}"));
    params.join(", ")
}

fn ts_return(func: &Value) -> String {
    if !matches!(state_mutability(func), "view" | "pure") {
        return "ContractTransaction".to_string();
    }
    let outputs = func["outputs"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    match outputs {
        [] => "void".to_string(),
        [single] => ts_type(single, Direction::Output),
        many => format!(
            "[{}]",
            many.iter()
                .map(|p| ts_type(p, Direction::Output))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

fn ts_type(param: &Value, direction: Direction) -> String {
    let ty = param["type"].as_str().unwrap_or_default();

    if let Some(open) = ty.rfind('[') {
        let mut inner = param.clone();
        inner["type"] = Value::String(ty[..open].to_string());
        return format!("{}[]", ts_type(&inner, direction));
    }

    if ty == "tuple" {
        let fields = param["components"]
            .as_array()
            .map(|c| {
                c.iter()
                    .enumerate()
                    .map(|(i, field)| {
                        let name = field["name"]
                            .as_str()
                            .filter(|n| !n.is_empty())
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("field{i}"));
                        format!("{name}: {}", ts_type(field, direction))
                    })
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default();
        return format!("{{ {fields} }}");
    }

    match (ty, direction) {
        ("address" | "string", _) => "string".to_string(),
        ("bool", _) => "boolean".to_string(),
        (t, Direction::Input) if t.starts_with("bytes") => "BytesLike".to_string(),
        (t, Direction::Output) if t.starts_with("bytes") => "string".to_string(),
        (t, Direction::Input) if t.starts_with("uint") || t.starts_with("int") => {
            "BigNumberish".to_string()
        }
        (t, Direction::Output) if t.starts_with("uint") || t.starts_with("int") => {
            // ethers returns plain numbers for integers up to 48 bits
            let bits: u32 = t
                .trim_start_matches("uint")
                .trim_start_matches("int")
                .parse()
                .unwrap_or(256);
            if bits <= 48 {
                "number".to_string()
            } else {
                "BigNumber".to_string()
            }
        }
        _ => "unknown".to_string(),
    }
}
