//! The `console` global, routed through the logging layer.

use rquickjs::prelude::Rest;
use rquickjs::{Coerced, Ctx, Function, Object};
use tracing::{debug, error, info, warn};

fn join(parts: Rest<Coerced<String>>) -> String {
    let mut text = parts
        .into_inner()
        .into_iter()
        .map(|mut part| {
            part.0.push(' ');
            part.0
        })
        .collect::<String>();
    text.pop();
    text
}

pub fn install(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;

    let log = Function::new(ctx.clone(), |parts: Rest<Coerced<String>>| {
        let text = join(parts);
        println!("{text}");
        debug!(target: "script", "{text}");
    })?;
    console.set("log", log.clone())?;
    console.set("debug", log.clone())?;

    console.set(
        "info",
        Function::new(ctx.clone(), |parts: Rest<Coerced<String>>| {
            let text = join(parts);
            println!("{text}");
            info!(target: "script", "{text}");
        })?,
    )?;

    console.set(
        "warn",
        Function::new(ctx.clone(), |parts: Rest<Coerced<String>>| {
            let text = join(parts);
            eprintln!("{text}");
            warn!(target: "script", "{text}");
        })?,
    )?;

    console.set(
        "error",
        Function::new(ctx.clone(), |parts: Rest<Coerced<String>>| {
            let text = join(parts);
            eprintln!("{text}");
            error!(target: "script", "{text}");
        })?,
    )?;

    ctx.globals().set("console", console)?;
    Ok(())
}
