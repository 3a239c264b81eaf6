//! Minimal typed AST for the emitted C dialect, plus its printer.
//!
//! The printer has exactly one rendering per node kind: byte-identical ASTs
//! print to byte-identical source. Build caching and the bridge's struct
//! layout computation both rely on that.

use std::fmt::Write as _;

const INDENT: &str = "    ";

/// C type expression. Only the shapes the generators need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CType {
    Named(String),
    Struct(String),
    Pointer(Box<CType>),
}

impl CType {
    pub fn named(name: impl Into<String>) -> Self {
        CType::Named(name.into())
    }

    pub fn struct_(name: impl Into<String>) -> Self {
        CType::Struct(name.into())
    }

    pub fn pointer_to(inner: CType) -> Self {
        CType::Pointer(Box::new(inner))
    }

    fn render(&self) -> String {
        match self {
            CType::Named(name) => name.clone(),
            CType::Struct(name) => format!("struct {name}"),
            CType::Pointer(inner) => format!("{} *", inner.render()),
        }
    }

    /// Renders a declarator, keeping the pointer star attached to the name.
    fn render_decl(&self, name: &str) -> String {
        match self {
            CType::Pointer(inner) => format!("{} *{name}", inner.render()),
            other => format!("{} {name}", other.render()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl Constant {
    fn render(&self) -> String {
        match self {
            Constant::Int(value) => value.to_string(),
            Constant::Float(value) => {
                let base = value.to_string();
                if base.contains('.') || base.contains('e') || base.contains('E') {
                    base
                } else {
                    format!("{base}.0")
                }
            }
            Constant::Bool(value) => if *value { "1" } else { "0" }.to_string(),
            Constant::Null => "NULL".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A bare identifier, rendered verbatim.
    Variable(String),
    Constant(Constant),
    Call { name: String, args: Vec<Expr> },
    /// `base->field`, a field access through a struct pointer.
    Arrow { base: Box<Expr>, field: String },
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            name: name.into(),
            args,
        }
    }

    pub fn arrow(base: Expr, field: impl Into<String>) -> Self {
        Expr::Arrow {
            base: Box::new(base),
            field: field.into(),
        }
    }

    pub fn null() -> Self {
        Expr::Constant(Constant::Null)
    }

    fn render(&self) -> String {
        match self {
            Expr::Variable(name) => name.clone(),
            Expr::Constant(constant) => constant.render(),
            Expr::Call { name, args } => {
                let args: Vec<String> = args.iter().map(Expr::render).collect();
                format!("{name}({})", args.join(", "))
            }
            Expr::Arrow { base, field } => format!("{}->{field}", base.render()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign { target: Expr, value: Expr },
    /// Local declaration, optionally initialized.
    Declare {
        ty: CType,
        name: String,
        init: Option<Expr>,
    },
    Expr(Expr),
    Return(Expr),
    /// Local struct variable with designated initializers.
    StructInit(StructInit),
}

impl Stmt {
    fn render(&self, out: &mut String, indent: usize) {
        let pad = INDENT.repeat(indent);
        match self {
            Stmt::Assign { target, value } => {
                let _ = writeln!(out, "{pad}{} = {};", target.render(), value.render());
            }
            Stmt::Declare { ty, name, init } => match init {
                Some(init) => {
                    let _ = writeln!(out, "{pad}{} = {};", ty.render_decl(name), init.render());
                }
                None => {
                    let _ = writeln!(out, "{pad}{};", ty.render_decl(name));
                }
            },
            Stmt::Expr(expr) => {
                let _ = writeln!(out, "{pad}{};", expr.render());
            }
            Stmt::Return(expr) => {
                let _ = writeln!(out, "{pad}return {};", expr.render());
            }
            Stmt::StructInit(init) => init.render(out, indent),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    pub path: String,
    pub system: bool,
}

impl Include {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            system: false,
        }
    }

    fn render(&self, out: &mut String) {
        if self.system {
            let _ = writeln!(out, "#include <{}>", self.path);
        } else {
            let _ = writeln!(out, "#include \"{}\"", self.path);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub ty: CType,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<StructField>,
}

impl StructDef {
    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "struct {}", self.name);
        out.push_str("{\n");
        for field in &self.fields {
            let _ = writeln!(out, "{INDENT}{};", field.ty.render_decl(&field.name));
        }
        out.push_str("};\n");
    }
}

/// `[static] struct TY NAME = {.field = value, ...};`
#[derive(Debug, Clone, PartialEq)]
pub struct StructInit {
    pub struct_type: String,
    pub name: String,
    pub fields: Vec<(String, Expr)>,
    pub is_static: bool,
}

impl StructInit {
    fn render(&self, out: &mut String, indent: usize) {
        let pad = INDENT.repeat(indent);
        let storage = if self.is_static { "static " } else { "" };
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(name, value)| format!(".{name} = {}", value.render()))
            .collect();
        let _ = writeln!(
            out,
            "{pad}{storage}struct {} {} = {{{}}};",
            self.struct_type,
            self.name,
            fields.join(", ")
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub ty: CType,
    pub name: String,
}

impl Parameter {
    pub fn new(ty: CType, name: impl Into<String>) -> Self {
        Self {
            ty,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub return_type: CType,
    pub name: String,
    pub params: Vec<Parameter>,
    pub body: Vec<Stmt>,
}

impl FunctionDef {
    fn render(&self, out: &mut String) {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|param| param.ty.render_decl(&param.name))
            .collect();
        let _ = writeln!(
            out,
            "{} {}({})",
            self.return_type.render(),
            self.name,
            params.join(", ")
        );
        out.push_str("{\n");
        for stmt in &self.body {
            stmt.render(out, 1);
        }
        out.push_str("}\n");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GlobalItem {
    Struct(StructDef),
    Init(StructInit),
}

/// One generated translation unit: includes, then globals, then functions.
#[derive(Debug, Clone, Default)]
pub struct CFile {
    pub includes: Vec<Include>,
    pub globals: Vec<GlobalItem>,
    pub functions: Vec<FunctionDef>,
}

impl CFile {
    pub fn render(&self) -> String {
        let mut out = String::new();
        for include in &self.includes {
            include.render(&mut out);
        }
        out.push('\n');
        for global in &self.globals {
            match global {
                GlobalItem::Struct(def) => def.render(&mut out),
                GlobalItem::Init(init) => init.render(&mut out, 0),
            }
            out.push('\n');
        }
        for function in &self.functions {
            function.render(&mut out);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_def_prints_pointer_fields() {
        let def = StructDef {
            name: "eval_inputs".to_string(),
            fields: vec![
                StructField {
                    ty: CType::pointer_to(CType::named("Array")),
                    name: "weight".to_string(),
                },
                StructField {
                    ty: CType::pointer_to(CType::named("Array")),
                    name: "x".to_string(),
                },
            ],
        };
        let mut out = String::new();
        def.render(&mut out);
        assert_eq!(
            out,
            "struct eval_inputs\n{\n    Array *weight;\n    Array *x;\n};\n"
        );
    }

    #[test]
    fn call_and_arrow_render_deterministically() {
        let expr = Expr::call(
            "add",
            vec![
                Expr::arrow(Expr::var("inputs"), "lhs"),
                Expr::var("cache.rhs"),
                Expr::Constant(Constant::Int(0)),
            ],
        );
        assert_eq!(expr.render(), "add(inputs->lhs, cache.rhs, 0)");
    }

    #[test]
    fn identical_files_print_identically() {
        let build = || {
            let mut file = CFile::default();
            file.includes.push(Include::local("arrays.h"));
            file.functions.push(FunctionDef {
                return_type: CType::struct_("eval_outputs"),
                name: "evaluate".to_string(),
                params: vec![Parameter::new(
                    CType::pointer_to(CType::struct_("eval_inputs")),
                    "inputs",
                )],
                body: vec![Stmt::Return(Expr::var("output_struct"))],
            });
            file.render()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn float_constants_keep_a_decimal_point() {
        assert_eq!(Constant::Float(2.0).render(), "2.0");
        assert_eq!(Constant::Float(0.5).render(), "0.5");
    }
}
