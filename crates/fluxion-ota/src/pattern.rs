// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Shell-style asset name matching
//!
//! Supports `*`, `?`, bracket classes (`[a-z]`, `[!0-9]`, `[^x]`) and `\`
//! escapes. `/` and leading dots are ordinary characters.

/// Returns true if `name` matches the glob `pattern` in full
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();

    let mut pi = 0;
    let mut ni = 0;
    // Position of the last '*' and the name index it is currently absorbing up to
    let mut backtrack: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ni));
            pi += 1;
            continue;
        }

        if let Some(next) = match_single(&p, pi, n[ni]) {
            pi = next;
            ni += 1;
            continue;
        }

        match backtrack {
            Some((star, absorbed)) => {
                pi = star + 1;
                ni = absorbed + 1;
                backtrack = Some((star, absorbed + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Match one pattern token at `pi` against `c`, returning the index after the token
fn match_single(p: &[char], pi: usize, c: char) -> Option<usize> {
    match p.get(pi)? {
        '*' => None,
        '?' => Some(pi + 1),
        '[' => match match_class(p, pi, c) {
            Some((true, next)) => Some(next),
            Some((false, _)) => None,
            // Unterminated class, '[' is a literal
            None => (c == '[').then_some(pi + 1),
        },
        '\\' if pi + 1 < p.len() => (p[pi + 1] == c).then_some(pi + 2),
        &literal => (literal == c).then_some(pi + 1),
    }
}

/// Evaluate the bracket class starting at `start`; `None` if it never closes
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = matches!(p.get(i), Some('!' | '^'));
    if negate {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    loop {
        let &ch = p.get(i)?;
        if ch == ']' && !first {
            break;
        }
        first = false;

        let lo = if ch == '\\' && i + 1 < p.len() {
            i += 1;
            p[i]
        } else {
            ch
        };
        i += 1;

        if p.get(i) == Some(&'-') && p.get(i + 1).is_some_and(|&hi| hi != ']') {
            let hi = p[i + 1];
            i += 2;
            if lo <= c && c <= hi {
                matched = true;
            }
        } else if lo == c {
            matched = true;
        }
    }

    Some((matched != negate, i + 1))
}
