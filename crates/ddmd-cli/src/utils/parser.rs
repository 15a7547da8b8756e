use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid grid '{0}'. Expected three comma-separated positive integers (e.g., '2,2,1').")]
    InvalidGrid(String),

    #[error("Invalid --set format: '{0}'. Expected KEY=VALUE.")]
    InvalidAssignment(String),
}

/// Parses a domain grid written as `X,Y,Z`.
pub fn parse_grid(s: &str) -> Result<[usize; 3], ParseError> {
    let invalid = || ParseError::InvalidGrid(s.to_string());
    let dims: Vec<usize> = s
        .split(',')
        .map(|part| part.trim().parse::<usize>().map_err(|_| invalid()))
        .collect::<Result<_, _>>()?;
    match dims.as_slice() {
        [x, y, z] if *x > 0 && *y > 0 && *z > 0 => Ok([*x, *y, *z]),
        _ => Err(invalid()),
    }
}

/// Splits a `KEY=VALUE` assignment at the first `=`.
pub fn parse_assignment(s: &str) -> Result<(&str, &str), ParseError> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value.trim())),
        _ => Err(ParseError::InvalidAssignment(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_accepts_three_positive_dimensions() {
        assert_eq!(parse_grid("2,2,1"), Ok([2, 2, 1]));
        assert_eq!(parse_grid(" 3, 1 ,1 "), Ok([3, 1, 1]));
    }

    #[test]
    fn grid_rejects_wrong_arity_and_zero() {
        assert!(parse_grid("2,2").is_err());
        assert!(parse_grid("2,2,1,1").is_err());
        assert!(parse_grid("2,0,1").is_err());
        assert!(parse_grid("a,b,c").is_err());
    }

    #[test]
    fn assignment_splits_at_first_equals_sign() {
        assert_eq!(parse_assignment("run.seed=4"), Ok(("run.seed", "4")));
        assert_eq!(parse_assignment("a=b=c"), Ok(("a", "b=c")));
        assert!(parse_assignment("no-equals").is_err());
        assert!(parse_assignment("=3").is_err());
    }
}
