#![forbid(unsafe_code)]

use std::collections::HashMap;

/// One IRC line: `[@tags] [:prefix] COMMAND [params] [:trailing]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
	pub tags: HashMap<String, String>,
	pub prefix: Option<String>,
	pub command: String,
	pub params: Vec<String>,
}

fn unescape_tag_value(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	let mut chars = raw.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	out
}

fn parse_tags(raw: &str) -> HashMap<String, String> {
	raw.split(';')
		.filter(|kv| !kv.is_empty())
		.map(|kv| match kv.split_once('=') {
			Some((k, v)) => (k.to_string(), unescape_tag_value(v)),
			None => (kv.to_string(), String::new()),
		})
		.collect()
}

impl IrcMessage {
	pub fn parse(line: &str) -> Option<Self> {
		let line = line.trim_end_matches(['\r', '\n']);
		if line.is_empty() {
			return None;
		}

		let (tags, rest) = if let Some(stripped) = line.strip_prefix('@') {
			let space = stripped.find(' ')?;
			(parse_tags(&stripped[..space]), stripped[space + 1..].trim_start())
		} else {
			(HashMap::new(), line)
		};

		let (prefix, rest) = if let Some(stripped) = rest.strip_prefix(':') {
			let space = stripped.find(' ')?;
			(Some(stripped[..space].to_string()), stripped[space + 1..].trim_start())
		} else {
			(None, rest)
		};

		let (params_part, trailing) = if let Some(stripped) = rest.strip_prefix(':') {
			("", Some(stripped))
		} else if let Some(colon_pos) = rest.find(" :") {
			(&rest[..colon_pos], Some(&rest[colon_pos + 2..]))
		} else {
			(rest, None)
		};

		let mut parts = params_part.split_whitespace();
		let command = parts.next()?.to_ascii_uppercase();
		let mut params: Vec<String> = parts.map(str::to_string).collect();
		if let Some(t) = trailing {
			params.push(t.to_string());
		}

		Some(Self {
			tags,
			prefix,
			command,
			params,
		})
	}

	/// Nick from `nick!user@host`.
	pub fn nick(&self) -> Option<&str> {
		let prefix = self.prefix.as_deref()?;
		let end = prefix.find('!').unwrap_or(prefix.len());
		let nick = &prefix[..end];
		if nick.is_empty() { None } else { Some(nick) }
	}

	pub fn tag(&self, key: &str) -> Option<&str> {
		self.tags.get(key).map(String::as_str)
	}

	pub fn param(&self, idx: usize) -> Option<&str> {
		self.params.get(idx).map(String::as_str)
	}

	/// Last parameter, which carries free text for most commands.
	pub fn trailing(&self) -> Option<&str> {
		self.params.last().map(String::as_str)
	}
}
