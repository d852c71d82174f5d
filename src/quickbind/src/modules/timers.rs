//! `setTimeout` / `setInterval` globals. Due timers fire during the runtime
//! service tick, on the host thread like everything else script-facing.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rquickjs::function::Args;
use rquickjs::prelude::Rest;
use rquickjs::{Ctx, Exception, Function, Persistent, Value};
use tracing::error;

struct Timer {
    id: u32,
    deadline: Instant,
    period: Option<Duration>,
    callback: Persistent<Function<'static>>,
    args: Vec<Persistent<Value<'static>>>,
}

#[derive(Default)]
struct TimerInner {
    timers: RefCell<Vec<Timer>>,
    next_id: RefCell<u32>,
}

/// The timer queue; cloneable handle shared between the runtime and the
/// installed globals.
#[derive(Clone, Default)]
pub struct TimerQueue {
    inner: Rc<TimerInner>,
}

fn js_fn<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Rest<Value<'js>>) -> rquickjs::Result<Value<'js>>,
{
    f
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let globals = ctx.globals();

        for (name, once) in [("setTimeout", true), ("setInterval", false)] {
            let queue = self.clone();
            let f = Function::new(
                ctx.clone(),
                js_fn(move |ctx: Ctx<'_>, args: Rest<Value<'_>>| {
                    let args = args.into_inner();
                    let Some(callback) = args.first().and_then(|v| v.as_function()).cloned() else {
                        return Err(Exception::throw_type(&ctx, "first argument must be a function"));
                    };
                    let delay_ms = match args.get(1) {
                        None => 0.0,
                        Some(v) => v.as_number().ok_or_else(|| {
                            Exception::throw_type(&ctx, "second argument must be a number")
                        })?,
                    };
                    let extra = args.iter().skip(2).cloned().collect::<Vec<_>>();
                    let id = queue.set(&ctx, callback, delay_ms.max(0.0), extra, once);
                    Ok(Value::new_number(ctx, f64::from(id)))
                }),
            )?
            .with_name(name)?;
            globals.set(name, f)?;
        }

        for name in ["clearTimeout", "clearInterval"] {
            let queue = self.clone();
            let f = Function::new(
                ctx.clone(),
                js_fn(move |ctx: Ctx<'_>, args: Rest<Value<'_>>| {
                    let args = args.into_inner();
                    let Some(id) = args.first().and_then(|v| v.as_number()) else {
                        return Err(Exception::throw_type(&ctx, "first argument must be a number"));
                    };
                    queue.clear(id as u32);
                    Ok(Value::new_undefined(ctx))
                }),
            )?
            .with_name(name)?;
            globals.set(name, f)?;
        }

        Ok(())
    }

    fn set<'js>(
        &self,
        ctx: &Ctx<'js>,
        callback: Function<'js>,
        delay_ms: f64,
        args: Vec<Value<'js>>,
        once: bool,
    ) -> u32 {
        let mut next = self.inner.next_id.borrow_mut();
        *next += 1;
        let id = *next;
        drop(next);

        let delay = Duration::from_millis(delay_ms as u64);
        self.inner.timers.borrow_mut().push(Timer {
            id,
            deadline: Instant::now() + delay,
            period: (!once).then_some(delay),
            callback: Persistent::save(ctx, callback),
            args: args.into_iter().map(|v| Persistent::save(ctx, v)).collect(),
        });
        id
    }

    pub fn clear(&self, id: u32) {
        self.inner.timers.borrow_mut().retain(|t| t.id != id);
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.timers.borrow().is_empty()
    }

    /// Fires every due timer. Returns `true` while timers remain scheduled.
    pub fn service(&self, ctx: &Ctx<'_>) -> bool {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut timers = self.inner.timers.borrow_mut();
            let mut i = 0;
            while i < timers.len() {
                if timers[i].deadline <= now {
                    match timers[i].period {
                        Some(period) => {
                            timers[i].deadline = now + period;
                            due.push((
                                timers[i].callback.clone(),
                                timers[i].args.clone(),
                            ));
                            i += 1;
                        }
                        None => {
                            let timer = timers.remove(i);
                            due.push((timer.callback, timer.args));
                        }
                    }
                } else {
                    i += 1;
                }
            }
        }

        for (callback, args) in due {
            let fired: rquickjs::Result<()> = (|| {
                let callback = callback.restore(ctx)?;
                let mut call_args = Args::new(ctx.clone(), args.len());
                for arg in args {
                    call_args.push_arg(arg.restore(ctx)?)?;
                }
                callback.call_arg::<()>(call_args)?;
                Ok(())
            })();
            if let Err(err) = fired {
                error!(?err, "timer callback failed");
            }
        }

        self.has_pending()
    }

    /// Drops every engine handle. Runs at shutdown before the context does.
    pub fn release(&self) {
        self.inner.timers.borrow_mut().clear();
    }
}
