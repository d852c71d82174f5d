//! Minimal embedding: bind a struct, a class and a couple of functions,
//! then drive them from a script.
//!
//! ```shell
//! cargo run --example bind_basics
//! ```

use std::mem::offset_of;
use std::rc::Rc;

use anyhow::Result;
use quickbind::{register_builtins, Runtime, RuntimeConfig};
use quickbind_reflect::{ctor2, describe, method0, wrap2, Registry};

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Point {
    x: f64,
    y: f64,
}

struct Turtle {
    position: Point,
    trail: Vec<Point>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let registry = Rc::new(Registry::new());
    register_builtins(&registry);

    let f64_ty = registry.f64_type();
    let mut b = registry.struct_of::<Point>("Point")?;
    b.field("x", &f64_ty, offset_of!(Point, x))
        .field("y", &f64_ty, offset_of!(Point, y));
    let point = b.finish();
    registry.global_type(&point);

    let distance = registry.global_function(
        "distance",
        registry.f64_type(),
        &[("a", point.clone()), ("b", point.clone())],
        wrap2(|a: &Point, b: &Point| ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()),
    );
    describe(&distance)
        .desc("Distance between two points")
        .param(0, "a", "First point")
        .param(1, "b", "Second point")
        .returns("The Euclidean distance");

    let mut b = registry.class_of::<Turtle>("Turtle")?;
    b.field("position", &point, offset_of!(Turtle, position))
        .destructible::<Turtle>();
    b.ctor(
        &[("x", registry.f64_type()), ("y", registry.f64_type())],
        ctor2(|x: &f64, y: &f64| Turtle {
            position: Point { x: *x, y: *y },
            trail: Vec::new(),
        }),
    );
    b.method(
        "steps",
        registry.u32_type(),
        &[],
        method0(|t: &mut Turtle| {
            t.trail.push(t.position);
            t.trail.len() as u32
        }),
    );
    let turtle = b.finish();
    registry.global_type(&turtle);

    let mut runtime = Runtime::new(registry, RuntimeConfig::default())?;
    runtime.commit_bindings()?;

    runtime.execute(
        r#"
        const t = new Turtle(3, 4);
        console.log("distance from origin:", distance({x: 0, y: 0}, t.position));
        console.log("steps recorded:", t.steps());
        t.destroy();
        "#,
    )?;

    runtime.run_until_idle();
    Ok(())
}
