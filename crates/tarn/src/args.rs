//! Argument views for functions implemented in Rust.
//!
//! Natives receive their arguments as a slice of the caller's stack, with an optional
//! trailing dict of keyword arguments. `ArgValues` wraps that pair and provides the
//! arity checks every built-in starts with, producing the same messages regardless of
//! which function is being called.

use crate::{
    exception_private::{ExcType, RunResult},
    value::Value,
};

#[derive(Debug, Clone, Copy)]
pub(crate) struct ArgValues<'a> {
    positional: &'a [Value],
    kwargs: Option<Value>,
}

impl<'a> ArgValues<'a> {
    /// Splits the native calling convention: when `has_kw` is set the last value is the
    /// keyword dict.
    pub fn new(args: &'a [Value], has_kw: bool) -> Self {
        match (has_kw, args.split_last()) {
            (true, Some((&kwargs, positional))) => Self {
                positional,
                kwargs: Some(kwargs),
            },
            _ => Self {
                positional: args,
                kwargs: None,
            },
        }
    }

    /// Number of positional arguments.
    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn kwargs(&self) -> Option<Value> {
        self.kwargs
    }

    /// Positional arguments, rejecting keywords.
    pub fn positional(self, name: &str) -> RunResult<&'a [Value]> {
        match self.kwargs {
            Some(_) => Err(ExcType::type_error_no_kwargs(name)),
            None => Ok(self.positional),
        }
    }

    /// Positional arguments, leaving any keywords to the caller.
    pub fn positional_any(self) -> &'a [Value] {
        self.positional
    }

    /// Splits off the receiver of a method call.
    pub fn receiver(self, name: &str) -> RunResult<(Value, Self)> {
        match self.positional.split_first() {
            Some((&receiver, rest)) => Ok((
                receiver,
                Self {
                    positional: rest,
                    kwargs: self.kwargs,
                },
            )),
            None => Err(ExcType::type_error(format!("descriptor '{name}' needs an argument"))),
        }
    }

    pub fn check_zero_args(self, name: &str) -> RunResult<()> {
        match self.positional(name)? {
            [] => Ok(()),
            args => Err(ExcType::type_error_no_args(name, args.len())),
        }
    }

    pub fn get_one_arg(self, name: &str) -> RunResult<Value> {
        match *self.positional(name)? {
            [a] => Ok(a),
            ref args => Err(ExcType::type_error_arg_count(name, 1, args.len())),
        }
    }

    pub fn get_two_args(self, name: &str) -> RunResult<(Value, Value)> {
        match *self.positional(name)? {
            [a, b] => Ok((a, b)),
            ref args => Err(ExcType::type_error_arg_count(name, 2, args.len())),
        }
    }

    pub fn get_three_args(self, name: &str) -> RunResult<(Value, Value, Value)> {
        match *self.positional(name)? {
            [a, b, c] => Ok((a, b, c)),
            ref args => Err(ExcType::type_error_arg_count(name, 3, args.len())),
        }
    }

    pub fn get_zero_one_arg(self, name: &str) -> RunResult<Option<Value>> {
        match *self.positional(name)? {
            [] => Ok(None),
            [a] => Ok(Some(a)),
            ref args => Err(ExcType::type_error_at_most(name, 1, args.len())),
        }
    }

    pub fn get_one_two_args(self, name: &str) -> RunResult<(Value, Option<Value>)> {
        match *self.positional(name)? {
            [a] => Ok((a, None)),
            [a, b] => Ok((a, Some(b))),
            [] => Err(ExcType::type_error_at_least(name, 1, 0)),
            ref args => Err(ExcType::type_error_at_most(name, 2, args.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_dict_is_split_off() {
        let values = [Value::Int(1), Value::Int(2), Value::None];
        let args = ArgValues::new(&values, true);
        assert_eq!(args.len(), 2);
        assert_eq!(args.kwargs(), Some(Value::None));
        assert_eq!(
            args.get_two_args("f").unwrap_err().to_string(),
            "TypeError: f() takes no keyword arguments"
        );
    }

    #[test]
    fn arity_messages() {
        let values = [Value::Int(1), Value::Int(2)];
        let args = ArgValues::new(&values, false);
        assert_eq!(
            args.get_one_arg("len").unwrap_err().to_string(),
            "TypeError: len() takes exactly one argument (2 given)"
        );
        assert_eq!(
            args.check_zero_args("f").unwrap_err().to_string(),
            "TypeError: f() takes no arguments (2 given)"
        );
        assert_eq!(args.get_one_two_args("get").unwrap(), (Value::Int(1), Some(Value::Int(2))));
        assert_eq!(
            ArgValues::new(&[], false).get_one_two_args("get").unwrap_err().to_string(),
            "TypeError: get expected at least 1 argument, got 0"
        );
    }

    #[test]
    fn receiver_is_first_positional() {
        let values = [Value::Int(7), Value::Int(8)];
        let (receiver, rest) = ArgValues::new(&values, false).receiver("append").unwrap();
        assert_eq!(receiver, Value::Int(7));
        assert_eq!(rest.get_one_arg("append").unwrap(), Value::Int(8));
    }
}
