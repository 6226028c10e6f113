//! Demo functions hosted by `lip serve`.

use lip_core::{ErrorDescriptor, Service, Signature};
use serde_json::json;

/// Names of every demo function, in the order they are started.
pub const DEMO_FUNCTIONS: [&str; 3] = ["sum_of_squares", "add_ints", "divide"];

/// Build the demo services. `lru` is the cache capacity of the cached ones.
pub fn services(lru: usize) -> lip_core::Result<Vec<Service>> {
    Ok(vec![sum_of_squares(lru)?, add_ints(lru)?, divide()?])
}

fn sum_of_squares(lru: usize) -> lip_core::Result<Service> {
    Service::builder("sum_of_squares", |args| {
        let n: i64 = args.value("n")?;
        let mut total: i64 = 0;
        for i in 1..=n {
            total = i
                .checked_mul(i)
                .and_then(|square| total.checked_add(square))
                .ok_or_else(|| {
                    ErrorDescriptor::new("OverflowError", format!("sum of squares up to {} overflows", n))
                })?;
        }
        Ok(json!(total))
    })
    .docstring(
        "Calculate the sum of squares from 1 to n.\n\n\
         :param n: The number to calculate the sum of squares up to.\n\
         :return: The sum of squares from 1 to n.",
    )
    .signature(Signature::new(["n"]))
    .lru(lru)
    .build()
}

fn add_ints(lru: usize) -> lip_core::Result<Service> {
    Service::builder("add_ints", |args| {
        let mut total: i64 = 0;
        for value in args.rest() {
            let n = value.as_i64().ok_or_else(|| {
                ErrorDescriptor::invalid_arguments(format!("add_ints expects integers, got {}", value))
            })?;
            total = total
                .checked_add(n)
                .ok_or_else(|| ErrorDescriptor::new("OverflowError", "integer sum overflows"))?;
        }
        Ok(json!(total))
    })
    .docstring(
        "Add a list of integers.\n\n\
         :param a: A list of integers.\n\
         :return: The sum of the integers.",
    )
    .signature(Signature::variadic())
    .lru(lru)
    .build()
}

fn divide() -> lip_core::Result<Service> {
    Service::builder("divide", |args| {
        let a: f64 = args.value("a")?;
        let b: f64 = args.value("b")?;
        if b == 0.0 {
            return Err(ErrorDescriptor::new("ZeroDivisionError", "division by zero"));
        }
        Ok(json!(a / b))
    })
    .docstring("Divide a by b.")
    .signature(Signature::new(["a", "b"]))
    .build()
}
