//! xm domain configuration files
//!
//! Files are sequences of `key = value` assignments where a value is a quoted
//! string, an integer, a bare word or a bracketed list of values. Lists may
//! span several lines and `#` starts a comment.

use crate::xmlrpc::Value;
use cxm_core::error::{CxmError, CxmResult};
use std::collections::BTreeMap;
use std::fmt;

const DEFAULT_MEMORY_MB: i64 = 128;
const DEFAULT_VCPUS: i64 = 1;

/// A value assigned in a configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmValue {
    Str(String),
    Int(i64),
    /// Unquoted word such as `True` or `None`
    Word(String),
    List(Vec<XmValue>),
}

impl XmValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            XmValue::Str(s) | XmValue::Word(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            XmValue::Int(i) => Some(*i),
            XmValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Parsed configuration of one VM
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmConfig {
    entries: BTreeMap<String, XmValue>,
}

impl XmConfig {
    /// Parse the text of a configuration file. A key assigned twice keeps its
    /// last value.
    pub fn parse(text: &str) -> CxmResult<Self> {
        let tokens = tokenize(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let mut entries = BTreeMap::new();

        while let Some((token, line)) = parser.next() {
            let key = match token {
                Token::Word(word) => word,
                Token::Semicolon => continue,
                other => return Err(syntax(line, format!("expected a key, found {}", other))),
            };
            match parser.next() {
                Some((Token::Equals, _)) => {}
                _ => return Err(syntax(line, format!("expected '=' after {}", key))),
            }
            let value = parser.value(line)?;
            entries.insert(key, value);
        }

        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&XmValue> {
        self.entries.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(XmValue::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(XmValue::as_int)
    }

    /// String items of a list value. A single string counts as a one-item list.
    pub fn get_list(&self, key: &str) -> Vec<&str> {
        match self.get(key) {
            Some(XmValue::List(items)) => items.iter().filter_map(XmValue::as_str).collect(),
            Some(XmValue::Str(s)) => vec![s.as_str()],
            _ => Vec::new(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str("name")
    }

    /// Logical volumes backing the VM's `phy:` disks, as `/dev/<vg>/<lv>`
    pub fn lvs(&self) -> Vec<String> {
        self.get_list("disk")
            .into_iter()
            .filter_map(|disk| {
                let target = disk.split(',').next()?.trim();
                let path = target.strip_prefix("phy:")?;
                if path.is_empty() {
                    return None;
                }
                Some(match path.strip_prefix("/dev/") {
                    Some(_) => path.to_string(),
                    None => format!("/dev/{}", path),
                })
            })
            .collect()
    }

    /// Domain description accepted by the legacy `xend.domain.create` call
    pub fn to_sxp(&self, default_name: &str) -> Sxp {
        let mut vm = vec![
            Sxp::atom("vm"),
            Sxp::pair("name", self.name().unwrap_or(default_name)),
            Sxp::pair(
                "memory",
                self.get_int("memory").unwrap_or(DEFAULT_MEMORY_MB).to_string(),
            ),
        ];

        if let Some(maxmem) = self.get_int("maxmem") {
            vm.push(Sxp::pair("maxmem", maxmem.to_string()));
        }
        vm.push(Sxp::pair(
            "vcpus",
            self.get_int("vcpus").unwrap_or(DEFAULT_VCPUS).to_string(),
        ));

        for (key, default) in [
            ("on_poweroff", "destroy"),
            ("on_reboot", "restart"),
            ("on_crash", "restart"),
        ] {
            vm.push(Sxp::pair(key, self.get_str(key).unwrap_or(default)));
        }

        for key in ["bootloader", "bootloader_args", "uuid"] {
            if let Some(value) = self.get_str(key) {
                vm.push(Sxp::pair(key, value));
            }
        }

        if let Some(image) = self.image_sxp() {
            vm.push(Sxp::List(vec![Sxp::atom("image"), image]));
        }

        for disk in self.get_list("disk") {
            let mut fields = disk.split(',').map(str::trim);
            let mut vbd = vec![Sxp::atom("vbd")];
            if let Some(uname) = fields.next() {
                vbd.push(Sxp::pair("uname", uname));
            }
            if let Some(dev) = fields.next() {
                vbd.push(Sxp::pair("dev", dev));
            }
            if let Some(mode) = fields.next() {
                vbd.push(Sxp::pair("mode", mode));
            }
            vm.push(Sxp::List(vec![Sxp::atom("device"), Sxp::List(vbd)]));
        }

        for vif in self.get_list("vif") {
            let mut device = vec![Sxp::atom("vif")];
            for option in vif.split(',').map(str::trim).filter(|o| !o.is_empty()) {
                if let Some((key, value)) = option.split_once('=') {
                    device.push(Sxp::pair(key.trim(), value.trim()));
                }
            }
            vm.push(Sxp::List(vec![Sxp::atom("device"), Sxp::List(device)]));
        }

        Sxp::List(vm)
    }

    fn image_sxp(&self) -> Option<Sxp> {
        let builder = self.get_str("builder").unwrap_or("linux");
        let kernel = self.get_str("kernel");
        if kernel.is_none() && builder != "hvm" {
            return None;
        }

        let mut image = vec![Sxp::atom(builder)];
        for (key, sxp_key) in [
            ("kernel", "kernel"),
            ("ramdisk", "ramdisk"),
            ("root", "root"),
            ("extra", "args"),
        ] {
            if let Some(value) = self.get_str(key) {
                image.push(Sxp::pair(sxp_key, value));
            }
        }
        Some(Sxp::List(image))
    }
}

/// S-expression understood by xend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sxp {
    Atom(String),
    List(Vec<Sxp>),
}

impl Sxp {
    pub fn atom(value: impl Into<String>) -> Self {
        Sxp::Atom(value.into())
    }

    /// `(key value)`
    pub fn pair(key: &str, value: impl Into<String>) -> Self {
        Sxp::List(vec![Sxp::atom(key), Sxp::Atom(value.into())])
    }

    /// Value of the first `(key value)` child of a list
    pub fn child_value(&self, key: &str) -> Option<&str> {
        let Sxp::List(items) = self else {
            return None;
        };
        items.iter().find_map(|item| match item {
            Sxp::List(pair) => match pair.as_slice() {
                [Sxp::Atom(k), Sxp::Atom(v)] if k == key => Some(v.as_str()),
                _ => None,
            },
            Sxp::Atom(_) => None,
        })
    }

    /// XML-RPC form: atoms become strings and lists become arrays
    pub fn to_value(&self) -> Value {
        match self {
            Sxp::Atom(atom) => Value::String(atom.clone()),
            Sxp::List(items) => Value::Array(items.iter().map(Sxp::to_value).collect()),
        }
    }
}

impl fmt::Display for Sxp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sxp::Atom(atom) => {
                if atom.is_empty() || atom.contains(|c: char| c.is_whitespace() || c == '(' || c == ')') {
                    write!(f, "{:?}", atom)
                } else {
                    write!(f, "{}", atom)
                }
            }
            Sxp::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Str(String),
    Int(i64),
    Equals,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "'{}'", w),
            Token::Str(s) => write!(f, "string {:?}", s),
            Token::Int(i) => write!(f, "integer {}", i),
            Token::Equals => write!(f, "'='"),
            Token::LBracket => write!(f, "'['"),
            Token::RBracket => write!(f, "']'"),
            Token::Comma => write!(f, "','"),
            Token::Semicolon => write!(f, "';'"),
        }
    }
}

fn syntax(line: usize, details: impl fmt::Display) -> CxmError {
    CxmError::ConfigError(format!("VM configuration line {}: {}", line, details))
}

fn tokenize(text: &str) -> CxmResult<Vec<(Token, usize)>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '\\' if chars.peek() == Some(&'\n') => {}
            '#' => {
                while chars.peek().is_some_and(|&n| n != '\n') {
                    chars.next();
                }
            }
            '=' => tokens.push((Token::Equals, line)),
            '[' | '(' => tokens.push((Token::LBracket, line)),
            ']' | ')' => tokens.push((Token::RBracket, line)),
            ',' => tokens.push((Token::Comma, line)),
            ';' => tokens.push((Token::Semicolon, line)),
            '\'' | '"' => {
                let start = line;
                let mut value = String::new();
                let mut closed = false;
                while let Some(n) = chars.next() {
                    match n {
                        '\\' => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(other) => value.push(other),
                            None => break,
                        },
                        n if n == c => {
                            closed = true;
                            break;
                        }
                        '\n' => {
                            line += 1;
                            value.push('\n');
                        }
                        n => value.push(n),
                    }
                }
                if !closed {
                    return Err(syntax(start, "unterminated string"));
                }
                tokens.push((Token::Str(value), start));
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' => {
                let mut word = String::from(c);
                while let Some(&n) = chars.peek() {
                    if n.is_alphanumeric() || n == '_' || n == '-' || n == '.' {
                        word.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match word.parse::<i64>() {
                    Ok(i) => Token::Int(i),
                    Err(_) => Token::Word(word),
                };
                tokens.push((token, line));
            }
            other => return Err(syntax(line, format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn value(&mut self, line: usize) -> CxmResult<XmValue> {
        match self.next() {
            Some((Token::Str(s), _)) => Ok(XmValue::Str(s)),
            Some((Token::Int(i), _)) => Ok(XmValue::Int(i)),
            Some((Token::Word(w), _)) => Ok(XmValue::Word(w)),
            Some((Token::LBracket, _)) => {
                let mut items = Vec::new();
                loop {
                    match self.peek() {
                        Some(Token::RBracket) => {
                            self.pos += 1;
                            break;
                        }
                        Some(Token::Comma) => self.pos += 1,
                        Some(_) => items.push(self.value(line)?),
                        None => return Err(syntax(line, "unterminated list")),
                    }
                }
                Ok(XmValue::List(items))
            }
            Some((other, at)) => Err(syntax(at, format!("expected a value, found {}", other))),
            None => Err(syntax(line, "missing value")),
        }
    }
}
