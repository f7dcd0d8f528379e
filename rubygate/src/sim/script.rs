//! `load` for the sim runtime.
//!
//! Understands the declarative slice of Ruby that host tests and demos need: `class`/`module`
//! bodies, constant and class variable assignment from literals, `raise`, `puts` and `p`.
//! Anything else is a `SyntaxError`.
use std::{
    fs,
    path::{Path, PathBuf},
};

use super::{
    SimRuby,
    builtins::{parse_float, parse_integer},
    heap::symbol,
};
use crate::{Value, ValueType};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Nil,
    True,
    False,
    Int(i128),
    Float(f64),
    Str(String),
    Sym(String),
    Array(Vec<Expr>),
    /// `A::B`; a leading empty segment means `::A`.
    Const(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    Class {
        name: String,
        superclass: Option<Vec<String>>,
    },
    Module {
        name: String,
    },
    End,
    Constant {
        name: String,
        value: Expr,
    },
    ClassVar {
        name: String,
        value: Expr,
    },
    Raise {
        class: Option<Vec<String>>,
        message: Option<Expr>,
    },
    Puts(Vec<Expr>),
    P(Vec<Expr>),
}

#[derive(Debug, PartialEq)]
pub(crate) struct ParseError {
    pub line: usize,
    pub message: String,
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.rest().is_empty()
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            return true;
        }
        false
    }

    /// A keyword only matches when not followed by more identifier characters.
    fn keyword(&mut self, word: &str) -> bool {
        self.skip_ws();
        let Some(after) = self.rest().strip_prefix(word) else {
            return false;
        };
        if !after.starts_with(|c: char| c.is_alphanumeric() || c == '_') {
            self.pos += word.len();
            return true;
        }
        false
    }

    fn ident(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let start = self.pos;
        if !self.peek().is_some_and(|c| c.is_alphabetic() || c == '_') {
            return None;
        }
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.bump();
        }
        if self.peek().is_some_and(|c| c == '?' || c == '!') {
            self.bump();
        }
        Some(&self.text[start..self.pos])
    }

    fn constant(&mut self) -> Result<String, String> {
        match self.ident() {
            Some(name) if name.starts_with(|c: char| c.is_ascii_uppercase()) => {
                Ok(name.to_string())
            }
            Some(name) => Err(format!("unexpected '{name}', expecting constant name")),
            None => Err(self.unexpected()),
        }
    }

    fn const_path(&mut self) -> Result<Vec<String>, String> {
        let mut path = Vec::new();
        if self.eat("::") {
            path.push(String::new());
        }
        path.push(self.constant()?);
        while self.eat("::") {
            path.push(self.constant()?);
        }
        Ok(path)
    }

    fn unexpected(&mut self) -> String {
        self.skip_ws();
        match self.rest().split_whitespace().next() {
            Some(token) => format!("unexpected '{token}'"),
            None => "unexpected end-of-input".to_string(),
        }
    }

    fn string(&mut self, quote: char) -> Result<String, String> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err("unterminated string meets end of file".to_string()),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => {
                    let escaped = self.bump().ok_or("unterminated string meets end of file")?;
                    match (quote, escaped) {
                        ('"', 'n') => out.push('\n'),
                        ('"', 't') => out.push('\t'),
                        ('"', 'r') => out.push('\r'),
                        ('"', 'e') => out.push('\u{1b}'),
                        ('"', '0') => out.push('\0'),
                        (_, c) if c == quote || c == '\\' => out.push(c),
                        (_, c) => {
                            out.push('\\');
                            out.push(c);
                        }
                    }
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<Expr, String> {
        let start = self.pos;
        if self.peek().is_some_and(|c| c == '-' || c == '+') {
            self.bump();
        }
        let mut float = false;
        while let Some(c) = self.peek() {
            let previous = self.text[..self.pos].chars().last();
            let accept = match c {
                '0'..='9' | '_' => true,
                'a'..='f' | 'A'..='F' if self.text[start..self.pos].contains(['x', 'X']) => true,
                'x' | 'X' | 'b' | 'B' | 'o' | 'O' => previous == Some('0'),
                '.' if !float && self.rest()[1..].starts_with(|c: char| c.is_ascii_digit()) => {
                    float = true;
                    true
                }
                'e' | 'E' => {
                    float = true;
                    true
                }
                '+' | '-' => matches!(previous, Some('e' | 'E')),
                _ => false,
            };
            if !accept {
                break;
            }
            self.bump();
        }
        let literal = &self.text[start..self.pos];
        let parsed = if float {
            parse_float(literal).map(Expr::Float)
        } else {
            parse_integer(literal).map(Expr::Int)
        };
        parsed.ok_or_else(|| format!("invalid numeric literal '{literal}'"))
    }

    fn expr(&mut self) -> Result<Expr, String> {
        self.skip_ws();
        let Some(c) = self.peek() else {
            return Err("unexpected end-of-input".to_string());
        };
        match c {
            '"' | '\'' => {
                self.bump();
                self.string(c).map(Expr::Str)
            }
            ':' if !self.rest().starts_with("::") => {
                self.bump();
                match self.peek() {
                    Some(quote @ ('"' | '\'')) => {
                        self.bump();
                        self.string(quote).map(Expr::Sym)
                    }
                    _ => match self.ident() {
                        Some(name) => Ok(Expr::Sym(name.to_string())),
                        None => Err(self.unexpected()),
                    },
                }
            }
            '[' => {
                self.bump();
                let mut items = Vec::new();
                if self.eat("]") {
                    return Ok(Expr::Array(items));
                }
                loop {
                    items.push(self.expr()?);
                    if self.eat("]") {
                        return Ok(Expr::Array(items));
                    }
                    if !self.eat(",") {
                        return Err(self.unexpected());
                    }
                }
            }
            '0'..='9' => self.number(),
            '-' | '+' if self.rest()[1..].starts_with(|c: char| c.is_ascii_digit()) => {
                self.number()
            }
            ':' => self.const_path().map(Expr::Const),
            c if c.is_ascii_uppercase() => self.const_path().map(Expr::Const),
            _ => {
                if self.keyword("nil") {
                    Ok(Expr::Nil)
                } else if self.keyword("true") {
                    Ok(Expr::True)
                } else if self.keyword("false") {
                    Ok(Expr::False)
                } else {
                    Err(self.unexpected())
                }
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if self.at_end() {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if !self.eat(",") {
                return Ok(args);
            }
        }
    }

    fn assignment(&mut self) -> Result<Expr, String> {
        if self.rest().trim_start().starts_with("==") || !self.eat("=") {
            return Err(self.unexpected());
        }
        self.expr()
    }

    fn statement(&mut self) -> Result<Stmt, String> {
        if self.keyword("end") {
            return Ok(Stmt::End);
        }
        if self.keyword("class") {
            let name = self.constant()?;
            let superclass = if self.eat("<") {
                Some(self.const_path()?)
            } else {
                None
            };
            return Ok(Stmt::Class { name, superclass });
        }
        if self.keyword("module") {
            let name = self.constant()?;
            return Ok(Stmt::Module { name });
        }
        if self.keyword("raise") {
            if self.at_end() {
                return Ok(Stmt::Raise {
                    class: None,
                    message: None,
                });
            }
            if self.peek().is_some_and(|c| c.is_ascii_uppercase()) {
                let class = self.const_path()?;
                let message = if self.eat(",") {
                    Some(self.expr()?)
                } else {
                    None
                };
                return Ok(Stmt::Raise {
                    class: Some(class),
                    message,
                });
            }
            let message = self.expr()?;
            return Ok(Stmt::Raise {
                class: None,
                message: Some(message),
            });
        }
        if self.keyword("puts") {
            return self.arguments().map(Stmt::Puts);
        }
        if self.keyword("p") {
            return self.arguments().map(Stmt::P);
        }
        if self.eat("@@") {
            let name = match self.ident() {
                Some(name) => format!("@@{name}"),
                None => return Err(self.unexpected()),
            };
            let value = self.assignment()?;
            return Ok(Stmt::ClassVar { name, value });
        }
        if self.peek().is_some_and(|c| c.is_ascii_uppercase()) {
            let name = self.constant()?;
            let value = self.assignment()?;
            return Ok(Stmt::Constant { name, value });
        }
        Err(self.unexpected())
    }
}

/// The line without its `#` comment, quotes respected.
fn strip_comment(line: &str) -> &str {
    let mut quote = None;
    let mut escaped = false;
    for (index, c) in line.char_indices() {
        match (quote, c) {
            (Some(_), _) if escaped => escaped = false,
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (None, '"' | '\'') => quote = Some(c),
            (None, '#') => return &line[..index],
            _ => {}
        }
    }
    line
}

pub(crate) fn parse(source: &str) -> Result<Vec<(usize, Stmt)>, ParseError> {
    let mut statements = Vec::new();
    let mut depth = 0_usize;
    let mut last_line = 0;
    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        last_line = line;
        let mut cursor = Cursor::new(strip_comment(raw));
        if cursor.at_end() {
            continue;
        }
        let statement = cursor
            .statement()
            .and_then(|statement| {
                if cursor.at_end() {
                    Ok(statement)
                } else {
                    Err(cursor.unexpected())
                }
            })
            .map_err(|message| ParseError { line, message })?;
        match statement {
            Stmt::Class { .. } | Stmt::Module { .. } => depth += 1,
            Stmt::End if depth == 0 => {
                return Err(ParseError {
                    line,
                    message: "unexpected 'end'".to_string(),
                });
            }
            Stmt::End => depth -= 1,
            _ => {}
        }
        statements.push((line, statement));
    }
    if depth > 0 {
        return Err(ParseError {
            line: last_line,
            message: "unexpected end-of-input, expecting 'end'".to_string(),
        });
    }
    Ok(statements)
}

fn resolve(sim: &SimRuby, path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path);
    if candidate.is_absolute() || path.starts_with("./") || path.starts_with("../") {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let load_path = sim.st().load_path.clone();
    load_path
        .iter()
        .map(|dir| dir.join(candidate))
        .chain(std::iter::once(candidate.to_path_buf()))
        .find(|path| path.is_file())
}

fn resolve_constant(sim: &SimRuby, scopes: &[Value], path: &[String]) -> Value {
    let object = sim.core().object;
    let innermost = scopes.last().copied().unwrap_or(object);
    let (mut current, rest) = match path.split_first() {
        Some((first, rest)) if first.is_empty() => (object, rest),
        Some((first, rest)) => {
            let id = sim.id(first);
            let lexical = {
                let state = sim.st();
                scopes
                    .iter()
                    .rev()
                    .find_map(|&scope| state.constant_at(scope, id))
            };
            let value = match lexical {
                Some(value) => value,
                None => sim.lookup_constant(innermost, id, false),
            };
            (value, rest)
        }
        None => return sim.nil(),
    };
    for name in rest {
        let id = sim.id(name);
        current = sim.lookup_constant(current, id, false);
    }
    current
}

fn eval(sim: &SimRuby, scopes: &[Value], expr: &Expr) -> Value {
    match expr {
        Expr::Nil => sim.nil(),
        Expr::True => sim.boolean(true),
        Expr::False => sim.boolean(false),
        Expr::Int(int) => sim.st().integer(*int),
        Expr::Float(float) => sim.st().new_float(*float),
        Expr::Str(text) => sim.st().new_string(text.as_bytes()),
        Expr::Sym(name) => symbol(sim.id(name)),
        Expr::Array(items) => {
            let values = items.iter().map(|item| eval(sim, scopes, item)).collect();
            sim.st().new_array(values)
        }
        Expr::Const(path) => resolve_constant(sim, scopes, path),
    }
}

fn open_module(
    sim: &SimRuby,
    scopes: &[Value],
    name: &str,
    superclass: Option<&[String]>,
    is_class: bool,
) -> Value {
    let core = sim.core();
    let parent = scopes.last().copied().unwrap_or(core.object);
    let id = sim.id(name);
    let superclass = superclass.map(|path| resolve_constant(sim, scopes, path));
    let kind = if is_class { "class" } else { "module" };

    let existing = sim.st().constant_at(parent, id);
    if let Some(existing) = existing {
        let (matches, current_superclass) = {
            let state = sim.st();
            let data = state.module(existing);
            (
                data.is_some_and(|data| data.is_class == is_class),
                data.and_then(|data| data.superclass),
            )
        };
        if !matches {
            sim.raise(core.type_error, format!("{name} is not a {kind}"));
        }
        if superclass.is_some() && superclass != current_superclass {
            sim.raise(core.type_error, format!("superclass mismatch for class {name}"));
        }
        return existing;
    }

    let superclass = if is_class {
        let superclass = superclass.unwrap_or(core.object);
        let is_class_value = sim
            .st()
            .module(superclass)
            .is_some_and(|data| data.is_class);
        if !is_class_value {
            let description = sim.describe(superclass);
            sim.raise(
                core.type_error,
                format!("superclass must be an instance of Class (given {description})"),
            );
        }
        Some(superclass)
    } else {
        None
    };
    let mut state = sim.st();
    let qualified = state.qualified_name(parent, name);
    let module = state.new_module(Some(qualified), superclass);
    state.set_constant(parent, id, module);
    module
}

fn raise_statement(
    sim: &SimRuby,
    scopes: &[Value],
    class: Option<&[String]>,
    message: Option<&Expr>,
) -> ! {
    let core = sim.core();
    let message = message.map(|message| eval(sim, scopes, message));
    let exception = match (class, message) {
        (Some(class), message) => {
            let class = resolve_constant(sim, scopes, class);
            let args: Vec<Value> = message.into_iter().collect();
            sim.send(class, "new", &args)
        }
        (None, Some(message)) => {
            if sim.st().value_type(message) != ValueType::String {
                sim.raise(core.type_error, "exception class/object expected");
            }
            sim.send(core.runtime_error, "new", &[message])
        }
        (None, None) => sim.raise(core.runtime_error, "unhandled exception"),
    };
    sim.raise_exception(exception)
}

fn run(sim: &SimRuby, file: &str, top: Value, statements: &[(usize, Stmt)]) {
    let core = sim.core();
    let mut scopes = vec![top];
    let mut frames = Vec::new();
    for (line, statement) in statements {
        sim.set_line(*line);
        match statement {
            Stmt::Class { name, superclass } => {
                let class = open_module(sim, &scopes, name, superclass.as_deref(), true);
                scopes.push(class);
                frames.push(sim.push_frame(file, &format!("<class:{name}>")));
                sim.set_line(*line);
            }
            Stmt::Module { name } => {
                let module = open_module(sim, &scopes, name, None, false);
                scopes.push(module);
                frames.push(sim.push_frame(file, &format!("<module:{name}>")));
                sim.set_line(*line);
            }
            Stmt::End => {
                scopes.pop();
                if let Some(depth) = frames.pop() {
                    sim.truncate_frames(depth);
                }
            }
            Stmt::Constant { name, value } => {
                let value = eval(sim, &scopes, value);
                let id = sim.id(name);
                let parent = scopes.last().copied().unwrap_or(core.object);
                sim.st().set_constant(parent, id, value);
            }
            Stmt::ClassVar { name, value } => {
                if scopes.len() == 1 {
                    sim.raise(core.runtime_error, "class variable access from toplevel");
                }
                let value = eval(sim, &scopes, value);
                let id = sim.id(name);
                let mut state = sim.st();
                let module = scopes.last().copied().unwrap_or(core.object);
                if let Some(data) = state.module_mut(module) {
                    data.class_vars.insert(id, value);
                }
            }
            Stmt::Raise { class, message } => {
                raise_statement(sim, &scopes, class.as_deref(), message.as_ref())
            }
            Stmt::Puts(args) | Stmt::P(args) => {
                let values: Vec<Value> = args.iter().map(|arg| eval(sim, &scopes, arg)).collect();
                let method = if matches!(statement, Stmt::Puts(_)) { "puts" } else { "p" };
                let receiver = scopes.last().copied().unwrap_or(core.object);
                sim.send(receiver, method, &values);
            }
        }
    }
}

/// `rb_load`: resolve, parse, run. With `wrap` the top level is a fresh anonymous module.
pub(crate) fn load(sim: &SimRuby, path: &str, wrap: bool) {
    let core = sim.core();
    let Some(resolved) = resolve(sim, path) else {
        sim.raise(core.load_error, format!("cannot load such file -- {path}"))
    };
    let Ok(source) = fs::read_to_string(&resolved) else {
        sim.raise(core.load_error, format!("cannot load such file -- {path}"))
    };
    let file = resolved.display().to_string();
    let statements = match parse(&source) {
        Ok(statements) => statements,
        Err(err) => sim.raise(
            core.syntax_error,
            format!("{file}:{}: {}", err.line, err.message),
        ),
    };

    let top = if wrap {
        sim.st().new_module(None, None)
    } else {
        core.object
    };
    log::trace!("sim: running {file} ({} statements)", statements.len());
    let depth = sim.push_frame(&file, "<top (required)>");
    run(sim, &file, top, &statements);
    sim.truncate_frames(depth);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_bodies() {
        let source = "# config\nclass Outer < Base\n  LIMIT = -1_000 # max\n  module Inner\n    NAMES = [\"a#b\", :c, nil]\n  end\nend\n";
        let statements: Vec<Stmt> = parse(source).unwrap().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            statements,
            [
                Stmt::Class {
                    name: "Outer".to_string(),
                    superclass: Some(vec!["Base".to_string()]),
                },
                Stmt::Constant {
                    name: "LIMIT".to_string(),
                    value: Expr::Int(-1000),
                },
                Stmt::Module {
                    name: "Inner".to_string()
                },
                Stmt::Constant {
                    name: "NAMES".to_string(),
                    value: Expr::Array(vec![
                        Expr::Str("a#b".to_string()),
                        Expr::Sym("c".to_string()),
                        Expr::Nil,
                    ]),
                },
                Stmt::End,
                Stmt::End,
            ]
        );
    }

    #[test]
    fn literals() {
        let value = |text: &str| Cursor::new(text).expr().unwrap();
        assert_eq!(value("3.5e2"), Expr::Float(350.0));
        assert_eq!(value("0x10"), Expr::Int(16));
        assert_eq!(value("'it\\'s'"), Expr::Str("it's".to_string()));
        assert_eq!(value("\"tab\\t\""), Expr::Str("tab\t".to_string()));
        assert_eq!(value(":\"two words\""), Expr::Sym("two words".to_string()));
        assert_eq!(
            value("::Outer::Inner"),
            Expr::Const(vec![String::new(), "Outer".to_string(), "Inner".to_string()])
        );
    }

    #[test]
    fn raise_forms() {
        let statement = |text: &str| Cursor::new(text).statement().unwrap();
        assert_eq!(
            statement("raise"),
            Stmt::Raise {
                class: None,
                message: None
            }
        );
        assert_eq!(
            statement("raise ArgumentError, \"bad\""),
            Stmt::Raise {
                class: Some(vec!["ArgumentError".to_string()]),
                message: Some(Expr::Str("bad".to_string())),
            }
        );
    }

    #[test]
    fn syntax_errors_carry_the_line() {
        assert_eq!(
            parse("A = 1\nend\n"),
            Err(ParseError {
                line: 2,
                message: "unexpected 'end'".to_string()
            })
        );
        assert_eq!(parse("class A\n").unwrap_err().line, 1);
        let err = parse("X = 1\ndef foo\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.message, "unexpected 'def'");
        assert!(parse("X == 1").is_err(), "comparison is not assignment");
    }
}
