//! Parser and renderer for prompt template text.
//!
//! Two constructs are recognised:
//! - `<<name>>` substitutes a variable; unknown names are an error.
//! - `[% for x in range(n) %] ... [% endfor %]` repeats its body `n` times with
//!   `<<x>>` bound to the iteration index. `n` is an integer literal or the
//!   name of a variable holding one. Loops nest.
//!
//! Whitespace is never trimmed: tags are removed and every other character,
//! including newlines adjacent to tags, is emitted verbatim.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

const MAX_LOOP_ITERATIONS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unresolved template variable: {0}")]
    UnresolvedVariable(String),
    #[error("unterminated tag starting at offset {0}")]
    UnterminatedTag(usize),
    #[error("malformed block tag: [% {0} %]")]
    MalformedBlock(String),
    #[error("[% endfor %] without matching for at offset {0}")]
    UnexpectedEndFor(usize),
    #[error("loop opened at offset {0} is never closed")]
    UnclosedLoop(usize),
    #[error("loop count `{0}` is not a non-negative integer: {1}")]
    InvalidLoopCount(String, String),
    #[error("loop count {0} exceeds the limit of 1000")]
    LoopTooLarge(usize),
    #[error("template not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoopCount {
    Literal(usize),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Var(String),
    Loop {
        var: String,
        count: LoopCount,
        body: Vec<Node>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    nodes: Vec<Node>,
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").expect("static regex"))
}

fn for_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^for\s+([A-Za-z_][A-Za-z0-9_]*)\s+in\s+range\(\s*([A-Za-z_][A-Za-z0-9_.]*|\d+)\s*\)$")
            .expect("static regex")
    })
}

fn starts_identifier(rest: &str) -> bool {
    rest.chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
}

enum Block {
    For { var: String, count: LoopCount },
    EndFor,
}

fn parse_block(inner: &str) -> Result<Block, TemplateError> {
    let inner = inner.trim();
    if inner == "endfor" {
        return Ok(Block::EndFor);
    }
    let caps = for_tag_re()
        .captures(inner)
        .ok_or_else(|| TemplateError::MalformedBlock(inner.to_string()))?;
    let var = caps[1].to_string();
    let raw = &caps[2];
    let count = match raw.parse::<usize>() {
        Ok(n) => LoopCount::Literal(n),
        Err(_) => LoopCount::Variable(raw.to_string()),
    };
    Ok(Block::For { var, count })
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        // Each frame is (loop header, opening offset, collected nodes).
        let mut stack: Vec<(Option<(String, LoopCount)>, usize, Vec<Node>)> =
            vec![(None, 0, Vec::new())];
        let mut text = String::new();
        let mut pos = 0;

        let flush = |text: &mut String, nodes: &mut Vec<Node>| {
            if !text.is_empty() {
                nodes.push(Node::Text(std::mem::take(text)));
            }
        };

        while pos < source.len() {
            let rest = &source[pos..];
            let next_var = rest.find("<<");
            let next_block = rest.find("[%");
            let (offset, is_var) = match (next_var, next_block) {
                (None, None) => {
                    text.push_str(rest);
                    break;
                }
                (Some(v), None) => (v, true),
                (None, Some(b)) => (b, false),
                (Some(v), Some(b)) => {
                    if v < b {
                        (v, true)
                    } else {
                        (b, false)
                    }
                }
            };

            text.push_str(&rest[..offset]);
            let tag_start = pos + offset;
            let after_open = tag_start + 2;
            let close = if is_var { ">>" } else { "%]" };
            let close_rel = source[after_open..].find(close);

            if is_var {
                let name = close_rel.map(|c| source[after_open..after_open + c].trim());
                match (name, close_rel) {
                    (Some(name), Some(c)) if identifier_re().is_match(name) => {
                        if let Some(frame) = stack.last_mut() {
                            flush(&mut text, &mut frame.2);
                            frame.2.push(Node::Var(name.to_string()));
                        }
                        pos = after_open + c + 2;
                    }
                    (_, None) if starts_identifier(&source[after_open..]) => {
                        return Err(TemplateError::UnterminatedTag(tag_start));
                    }
                    _ => {
                        // Not a variable: keep one `<` and rescan from the next
                        // character, so a later `<<name>>` is still found.
                        text.push('<');
                        pos = tag_start + 1;
                    }
                }
                continue;
            }

            let Some(close_rel) = close_rel else {
                return Err(TemplateError::UnterminatedTag(tag_start));
            };
            let inner = &source[after_open..after_open + close_rel];
            let tag_end = after_open + close_rel + 2;
            match parse_block(inner)? {
                Block::For { var, count } => {
                    if let Some(frame) = stack.last_mut() {
                        flush(&mut text, &mut frame.2);
                    }
                    stack.push((Some((var, count)), tag_start, Vec::new()));
                }
                Block::EndFor => {
                    if stack.len() < 2 {
                        return Err(TemplateError::UnexpectedEndFor(tag_start));
                    }
                    let (header, _, mut body) = stack.pop().unwrap_or((None, 0, Vec::new()));
                    flush(&mut text, &mut body);
                    if let (Some((var, count)), Some(parent)) = (header, stack.last_mut()) {
                        parent.2.push(Node::Loop { var, count, body });
                    }
                }
            }
            pos = tag_end;
        }

        if stack.len() > 1 {
            let opened_at = stack.last().map(|f| f.1).unwrap_or(0);
            return Err(TemplateError::UnclosedLoop(opened_at));
        }
        let (_, _, mut nodes) = stack.pop().unwrap_or((None, 0, Vec::new()));
        flush(&mut text, &mut nodes);
        Ok(Self { nodes })
    }

    pub fn render(&self, vars: &HashMap<String, String>) -> Result<String, TemplateError> {
        let mut out = String::new();
        let mut scope: Vec<(String, String)> = Vec::new();
        render_nodes(&self.nodes, vars, &mut scope, &mut out)?;
        Ok(out)
    }

    /// Variable names referenced outside of loop bindings, in first-use order.
    pub fn variables(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_variables(&self.nodes, &mut Vec::new(), &mut names);
        names
    }
}

fn lookup<'a>(
    name: &str,
    vars: &'a HashMap<String, String>,
    scope: &'a [(String, String)],
) -> Option<&'a str> {
    scope
        .iter()
        .rev()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .or_else(|| vars.get(name).map(|v| v.as_str()))
}

fn render_nodes(
    nodes: &[Node],
    vars: &HashMap<String, String>,
    scope: &mut Vec<(String, String)>,
    out: &mut String,
) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Var(name) => {
                let value = lookup(name, vars, scope)
                    .ok_or_else(|| TemplateError::UnresolvedVariable(name.clone()))?;
                out.push_str(value);
            }
            Node::Loop { var, count, body } => {
                let n = match count {
                    LoopCount::Literal(n) => *n,
                    LoopCount::Variable(name) => {
                        let raw = lookup(name, vars, scope)
                            .ok_or_else(|| TemplateError::UnresolvedVariable(name.clone()))?;
                        raw.trim().parse::<usize>().map_err(|_| {
                            TemplateError::InvalidLoopCount(name.clone(), raw.to_string())
                        })?
                    }
                };
                if n > MAX_LOOP_ITERATIONS {
                    return Err(TemplateError::LoopTooLarge(n));
                }
                for i in 0..n {
                    scope.push((var.clone(), i.to_string()));
                    let result = render_nodes(body, vars, scope, out);
                    scope.pop();
                    result?;
                }
            }
        }
    }
    Ok(())
}

fn collect_variables(nodes: &[Node], bound: &mut Vec<String>, names: &mut Vec<String>) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Var(name) => {
                if !bound.contains(name) && !names.contains(name) {
                    names.push(name.clone());
                }
            }
            Node::Loop { var, count, body } => {
                if let LoopCount::Variable(name) = count
                    && !bound.contains(name)
                    && !names.contains(name)
                {
                    names.push(name.clone());
                }
                bound.push(var.clone());
                collect_variables(body, bound, names);
                bound.pop();
            }
        }
    }
}

/// Parse and render in one step.
pub fn render(source: &str, vars: &HashMap<String, String>) -> Result<String, TemplateError> {
    Template::parse(source)?.render(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn greeting_with_loop_golden() {
        let out = render(
            "Hello <<name>>[% for i in range(2) %] item<<i>>[% endfor %]",
            &vars(&[("name", "World")]),
        )
        .unwrap();
        assert_eq!(out, "Hello World item0 item1");
    }

    #[test]
    fn newlines_around_tags_are_kept_verbatim() {
        let src = "Beats:\n[% for n in range(3) %]\n- beat <<n>>\n[% endfor %]\nEnd";
        let out = render(src, &HashMap::new()).unwrap();
        assert_eq!(out, "Beats:\n\n- beat 0\n\n- beat 1\n\n- beat 2\n\nEnd");
    }

    #[test]
    fn whitespace_inside_tags_is_ignored() {
        let out = render(
            "[%for  k in range( 2 )%]<< k >>,[%  endfor %]",
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(out, "0,1,");
    }

    #[test]
    fn unresolved_variable_is_an_error() {
        let err = render("Dear <<reader>>", &HashMap::new()).unwrap_err();
        assert_eq!(err, TemplateError::UnresolvedVariable("reader".to_string()));
    }

    #[test]
    fn loop_count_from_variable() {
        let out = render(
            "[% for s in range(scenes) %]<<s>>[% endfor %]",
            &vars(&[("scenes", "4")]),
        )
        .unwrap();
        assert_eq!(out, "0123");

        let err = render(
            "[% for s in range(scenes) %]<<s>>[% endfor %]",
            &vars(&[("scenes", "many")]),
        )
        .unwrap_err();
        assert!(matches!(err, TemplateError::InvalidLoopCount(_, _)));
    }

    #[test]
    fn nested_loops_shadow_and_restore() {
        let out = render(
            "[% for i in range(2) %][% for j in range(2) %]<<i>><<j>> [% endfor %][% endfor %]",
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(out, "00 01 10 11 ");

        let out = render(
            "<<i>>[% for i in range(1) %]<<i>>[% endfor %]<<i>>",
            &vars(&[("i", "x")]),
        )
        .unwrap();
        assert_eq!(out, "x0x");
    }

    #[test]
    fn zero_iterations_emit_nothing() {
        let out = render("a[% for i in range(0) %]never<<missing>>[% endfor %]b", &HashMap::new())
            .unwrap();
        assert_eq!(out, "ab");
    }

    #[test]
    fn structural_errors() {
        assert_eq!(
            Template::parse("text <<open").unwrap_err(),
            TemplateError::UnterminatedTag(5)
        );
        assert_eq!(
            Template::parse("[% endfor %]").unwrap_err(),
            TemplateError::UnexpectedEndFor(0)
        );
        assert_eq!(
            Template::parse("x[% for i in range(2) %]y").unwrap_err(),
            TemplateError::UnclosedLoop(1)
        );
        assert!(matches!(
            Template::parse("[% if ready %]").unwrap_err(),
            TemplateError::MalformedBlock(_)
        ));
    }

    #[test]
    fn non_identifier_angles_are_literal() {
        let out = render("x << 3 and y >> 2", &HashMap::new()).unwrap();
        assert_eq!(out, "x << 3 and y >> 2");
    }

    #[test]
    fn bare_angles_do_not_hide_later_variables() {
        let out = render(
            "shift a << 2 then greet <<name>>",
            &vars(&[("name", "World")]),
        )
        .unwrap();
        assert_eq!(out, "shift a << 2 then greet World");

        let err = render("x << y <<missing>>", &HashMap::new()).unwrap_err();
        assert_eq!(err, TemplateError::UnresolvedVariable("missing".to_string()));

        assert_eq!(render("<<<name>>", &vars(&[("name", "W")])).unwrap(), "<W");
        assert_eq!(render("trailing <<", &HashMap::new()).unwrap(), "trailing <<");
    }

    #[test]
    fn oversized_loop_is_rejected() {
        let err = render("[% for i in range(5000) %]x[% endfor %]", &HashMap::new()).unwrap_err();
        assert_eq!(err, TemplateError::LoopTooLarge(5000));
    }

    #[test]
    fn variables_skip_loop_bindings() {
        let tpl = Template::parse(
            "<<title>> [% for i in range(count) %]<<i>> <<title>> <<genre>>[% endfor %]",
        )
        .unwrap();
        assert_eq!(tpl.variables(), vec!["title", "count", "genre"]);
    }
}
