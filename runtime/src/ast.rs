//! The typed expression tree the evaluator consumes.
//!
//! The lexer and parser live outside this runtime; hosts hand over a
//! fully-built [`Program`]. The tree is serde-serializable so a parser in
//! another process (or language) can ship programs as JSON.

use serde::{Deserialize, Serialize};

/// A complete program: top-level expressions evaluated in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub body: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Nil,
    Number {
        value: f64,
    },
    String {
        value: String,
    },
    Bool {
        value: bool,
    },
    /// Symbol literals are sugar for strings.
    Symbol {
        value: String,
    },
    Array {
        items: Vec<Expr>,
    },
    Object {
        entries: Vec<(String, Expr)>,
    },
    Identifier {
        name: String,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `set name = expr`: updates the nearest existing binding, or defines
    /// one in the current environment.
    Set {
        name: String,
        value: Box<Expr>,
    },
    If {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        #[serde(default)]
        else_branch: Option<Box<Expr>>,
    },
    Block {
        body: Vec<Expr>,
    },
    /// A function literal. The named form also binds the function in the
    /// environment it is evaluated in.
    Function {
        #[serde(default)]
        name: Option<String>,
        params: Vec<String>,
        body: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    MethodCall {
        target: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    StructDecl {
        name: String,
        fields: Vec<String>,
    },
    StructInit {
        name: String,
        fields: Vec<(String, Expr)>,
    },
    ServerDecl {
        name: String,
        state: Vec<(String, Expr)>,
        receivers: Vec<ReceiverDecl>,
    },
    /// Tagged switch: the scrutinee is matched against each case's literal
    /// pattern by deep equality.
    Dispatch {
        scrutinee: Box<Expr>,
        cases: Vec<DispatchCase>,
        #[serde(default)]
        default: Option<Box<Expr>>,
    },
    Return {
        #[serde(default)]
        value: Option<Box<Expr>>,
    },
    Throw {
        value: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchCase {
    pub pattern: Expr,
    pub body: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    /// `??`: right operand when the left evaluates to nil.
    Coalesce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
}

impl Expr {
    pub fn number(value: f64) -> Expr {
        Expr::Number { value }
    }

    pub fn string(value: impl Into<String>) -> Expr {
        Expr::String {
            value: value.into(),
        }
    }

    pub fn ident(name: impl Into<String>) -> Expr {
        Expr::Identifier { name: name.into() }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn call(callee: Expr, args: Vec<Expr>) -> Expr {
        Expr::Call {
            callee: Box::new(callee),
            args,
        }
    }

    pub fn method(target: Expr, method: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::MethodCall {
            target: Box::new(target),
            method: method.into(),
            args,
        }
    }

    pub fn block(body: Vec<Expr>) -> Expr {
        Expr::Block { body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ast_round_trips_through_json() {
        let expr = Expr::binary(
            BinaryOp::Add,
            Expr::ident("a"),
            Expr::method(Expr::ident("xs"), "get", vec![Expr::number(0.0)]),
        );
        let json = serde_json::to_string(&expr).unwrap();
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(expr, back);
    }

    #[test]
    fn kind_tags_are_snake_case() {
        let json = serde_json::to_value(Expr::method(Expr::ident("xs"), "length", vec![])).unwrap();
        assert_eq!(json["kind"], "method_call");
    }

    #[test]
    fn program_deserializes_from_parser_output() {
        let src = r#"{
            "body": [
                {"kind": "set", "name": "x", "value": {"kind": "number", "value": 2.0}},
                {"kind": "identifier", "name": "x"}
            ]
        }"#;
        let program: Program = serde_json::from_str(src).unwrap();
        assert_eq!(program.body.len(), 2);
    }
}
