//! Filesystem-style glob matching on plain strings.
//!
//! Supported syntax:
//! * `*` any run of characters except `/`
//! * `**` any run of characters including `/`; `**/` also matches zero directories
//! * `?` one character except `/`
//! * `[abc]`, `[a-z]`, `[!a-z]` / `[^a-z]` character classes
//! * `\x` literal `x`
//!
//! Nothing here touches the filesystem.

/// Maximum accepted pattern length.
pub const MAX_GLOB_LEN: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(char),
    AnyChar,
    Star,
    DoubleStar,
    /// `**/` - empty, or anything ending in `/`
    DoubleStarSlash,
    Class { negated: bool, items: Vec<ClassItem> },
}

#[derive(Debug, Clone, PartialEq)]
enum ClassItem {
    Single(char),
    Range(char, char),
}

impl ClassItem {
    fn contains(&self, c: char) -> bool {
        match *self {
            ClassItem::Single(x) => x == c,
            ClassItem::Range(lo, hi) => lo <= c && c <= hi,
        }
    }
}

/// Reason a glob was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobError(pub String);

impl std::fmt::Display for GlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn tokenize(pattern: &str) -> Result<Vec<Token>, GlobError> {
    if pattern.len() > MAX_GLOB_LEN {
        return Err(GlobError(format!(
            "glob longer than {} characters",
            MAX_GLOB_LEN
        )));
    }

    let chars: Vec<char> = pattern.chars().collect();
    let mut tokens = Vec::with_capacity(chars.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    // Collapse runs like `***` into one double star
                    let mut j = i + 2;
                    while chars.get(j) == Some(&'*') {
                        j += 1;
                    }
                    if chars.get(j) == Some(&'/') {
                        tokens.push(Token::DoubleStarSlash);
                        i = j + 1;
                    } else {
                        tokens.push(Token::DoubleStar);
                        i = j;
                    }
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '?' => {
                tokens.push(Token::AnyChar);
                i += 1;
            }
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| GlobError("dangling escape at end of glob".to_string()))?;
                tokens.push(Token::Literal(*escaped));
                i += 2;
            }
            '[' => {
                let (token, next) = parse_class(&chars, i)?;
                tokens.push(token);
                i = next;
            }
            c => {
                tokens.push(Token::Literal(c));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

/// Parse a character class starting at `chars[start] == '['`.
fn parse_class(chars: &[char], start: usize) -> Result<(Token, usize), GlobError> {
    let mut i = start + 1;
    let negated = matches!(chars.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }

    let mut items = Vec::new();
    let mut first = true;

    loop {
        let c = *chars
            .get(i)
            .ok_or_else(|| GlobError("unterminated character class".to_string()))?;

        // A leading `]` is a literal member
        if c == ']' && !first {
            i += 1;
            break;
        }
        first = false;

        let c = if c == '\\' {
            i += 1;
            *chars
                .get(i)
                .ok_or_else(|| GlobError("dangling escape in character class".to_string()))?
        } else {
            c
        };

        if chars.get(i + 1) == Some(&'-') && chars.get(i + 2).is_some_and(|&n| n != ']') {
            let hi = chars[i + 2];
            if hi < c {
                return Err(GlobError(format!("invalid range {}-{}", c, hi)));
            }
            items.push(ClassItem::Range(c, hi));
            i += 3;
        } else {
            items.push(ClassItem::Single(c));
            i += 1;
        }
    }

    Ok((Token::Class { negated, items }, i))
}

/// Check that a glob is well formed.
pub fn validate_glob(pattern: &str) -> Result<(), GlobError> {
    tokenize(pattern).map(|_| ())
}

/// Match `value` against `pattern`. Malformed patterns never match.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    match tokenize(pattern) {
        Ok(tokens) => run(&tokens, value),
        Err(_) => false,
    }
}

/// Simulate the pattern as an NFA over token positions.
///
/// State `i` means "tokens before `i` are satisfied". Runs in
/// O(tokens * chars) time with no recursion, so long values are safe.
fn run(tokens: &[Token], value: &str) -> bool {
    let mut current = vec![false; tokens.len() + 1];
    let mut next = vec![false; tokens.len() + 1];

    current[0] = true;
    close(tokens, &mut current);

    for c in value.chars() {
        next.iter_mut().for_each(|s| *s = false);

        for (ti, token) in tokens.iter().enumerate() {
            if !current[ti] {
                continue;
            }
            match token {
                Token::Literal(x) => {
                    if c == *x {
                        next[ti + 1] = true;
                    }
                }
                Token::AnyChar => {
                    if c != '/' {
                        next[ti + 1] = true;
                    }
                }
                Token::Class { negated, items } => {
                    let hit = items.iter().any(|item| item.contains(c));
                    if hit != *negated {
                        next[ti + 1] = true;
                    }
                }
                Token::Star => {
                    if c != '/' {
                        next[ti] = true;
                    }
                }
                Token::DoubleStar => next[ti] = true,
                Token::DoubleStarSlash => {
                    next[ti] = true;
                    if c == '/' {
                        next[ti + 1] = true;
                    }
                }
            }
        }

        close(tokens, &mut next);
        if !next.iter().any(|&s| s) {
            return false;
        }
        std::mem::swap(&mut current, &mut next);
    }

    current[tokens.len()]
}

/// Follow zero-width moves: every star may match nothing.
fn close(tokens: &[Token], states: &mut [bool]) {
    for ti in 0..tokens.len() {
        if states[ti]
            && matches!(
                tokens[ti],
                Token::Star | Token::DoubleStar | Token::DoubleStarSlash
            )
        {
            states[ti + 1] = true;
        }
    }
}
