//! Scalar math the fused loop calls into for anything beyond the SSE
//! intrinsics the code generator emits inline (`sqrt`, `floor`/`ceiling`/
//! `trunc`, `min`/`max`): the transcendentals.

#[no_mangle]
pub extern "C" fn vecjit_sin(x: f64) -> f64 {
    x.sin()
}

#[no_mangle]
pub extern "C" fn vecjit_cos(x: f64) -> f64 {
    x.cos()
}

#[no_mangle]
pub extern "C" fn vecjit_tan(x: f64) -> f64 {
    x.tan()
}

#[no_mangle]
pub extern "C" fn vecjit_asin(x: f64) -> f64 {
    x.asin()
}

#[no_mangle]
pub extern "C" fn vecjit_acos(x: f64) -> f64 {
    x.acos()
}

#[no_mangle]
pub extern "C" fn vecjit_atan(x: f64) -> f64 {
    x.atan()
}

#[no_mangle]
pub extern "C" fn vecjit_exp(x: f64) -> f64 {
    x.exp()
}

#[no_mangle]
pub extern "C" fn vecjit_log(x: f64) -> f64 {
    x.ln()
}

#[no_mangle]
pub extern "C" fn vecjit_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

#[no_mangle]
pub extern "C" fn vecjit_atan2(y: f64, x: f64) -> f64 {
    y.atan2(x)
}

#[no_mangle]
pub extern "C" fn vecjit_hypot(x: f64, y: f64) -> f64 {
    x.hypot(y)
}
