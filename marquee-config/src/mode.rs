use std::fmt;
use std::str::FromStr;

use knuffel::errors::DecodeError;

/// A display resolution as written in the config, e.g. `"1920x1080"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeSize {
    pub width: u16,
    pub height: u16,
}

impl ModeSize {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for ModeSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ModeSize {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .split_once(['x', 'X'])
            .ok_or("mode must be formatted as WIDTHxHEIGHT")?;

        let width = width
            .trim()
            .parse::<u16>()
            .map_err(|_| "error parsing mode width")?;
        let height = height
            .trim()
            .parse::<u16>()
            .map_err(|_| "error parsing mode height")?;

        if width == 0 || height == 0 {
            return Err("mode width and height must be non-zero");
        }

        Ok(Self { width, height })
    }
}

impl<S: knuffel::traits::ErrorSpan> knuffel::DecodeScalar<S> for ModeSize {
    fn type_check(
        type_name: &Option<knuffel::span::Spanned<knuffel::ast::TypeName, S>>,
        ctx: &mut knuffel::decode::Context<S>,
    ) {
        if let Some(type_name) = &type_name {
            ctx.emit_error(DecodeError::unexpected(
                type_name,
                "type name",
                "no type name expected for this node",
            ));
        }
    }

    fn raw_decode(
        val: &knuffel::span::Spanned<knuffel::ast::Literal, S>,
        ctx: &mut knuffel::decode::Context<S>,
    ) -> Result<ModeSize, DecodeError<S>> {
        match &**val {
            knuffel::ast::Literal::String(ref s) => match s.parse() {
                Ok(size) => Ok(size),
                Err(err) => {
                    ctx.emit_error(DecodeError::unexpected(val, "mode", err));
                    Ok(Self::new(0, 0))
                }
            },
            _ => {
                ctx.emit_error(DecodeError::unsupported(
                    val,
                    "modes must be strings like \"1920x1080\"",
                ));
                Ok(Self::new(0, 0))
            }
        }
    }
}
