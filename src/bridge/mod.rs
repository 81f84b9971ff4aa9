//! Establishing an application context and a native surface through managed calls.
//!
//! Once the runtime library refers to the created VM, the framework's managed code can
//! run in this process. The bridge registers the framework's native methods, brings up
//! the main looper and the system activity thread, injects a small helper class from a
//! dex and asks it for the display geometry and a surface.
//!
//! Each call is a named stage. A stage that fails, or leaves a managed exception
//! pending, ends the bridge with an error naming that stage; the exception is cleared
//! before the error is returned.
//!
//! | Stage                | Call                                                   |
//! |----------------------|--------------------------------------------------------|
//! | `start_registration` | `android::AndroidRuntime::startReg(JNIEnv*)`           |
//! | `prepare_main_looper`| `Looper.prepareMainLooper()`                           |
//! | `system_main`        | `ActivityThread.systemMain()`                          |
//! | `system_context`     | `ActivityThread#getSystemContext()`                    |
//! | `load_helper`        | `InMemoryDexClassLoader` + `loadClass`                 |
//! | `helper_main`        | helper `main(String[])`                                |
//! | `display_info`       | helper `getDisplayInfo()[I`                            |
//! | `create_surface`     | helper `createNativeWindow(IIZZ)Landroid/view/Surface;`|

mod dex;
mod exception;
mod plan;

pub use dex::{load_class, require_in_memory_loader, MIN_IN_MEMORY_API};
pub use exception::{guarded, ExceptionState};
pub use plan::{BridgePlan, DexSource, HelperPlan, ManagedMethod, DEX_ENV};

use jni::{
    objects::{GlobalRef, JClass, JIntArray, JValue},
    sys::jboolean,
    JNIEnv,
};
use strum::{Display, IntoStaticStr};
use tracing::{debug, info};

use crate::{
    platform::PlatformVersion, present::TouchPhase, resolver::StartRegFn, vm::Lifecycle,
    Error, Result,
};

const START_REGISTRATION: &str = "start_registration";
const PREPARE_MAIN_LOOPER: &str = "prepare_main_looper";
const SYSTEM_MAIN: &str = "system_main";
const SYSTEM_CONTEXT: &str = "system_context";
const HELPER_MAIN: &str = "helper_main";
const DISPLAY_INFO: &str = "display_info";
const CREATE_SURFACE: &str = "create_surface";
const INJECT_TOUCH: &str = "inject_touch";

/// The system context, owned for the rest of the process.
#[derive(Debug)]
pub struct ContextHandle {
    activity_thread: GlobalRef,
    context: GlobalRef,
}

impl ContextHandle {
    /// The `android.content.Context`.
    pub fn context(&self) -> &GlobalRef {
        &self.context
    }

    /// The `android.app.ActivityThread` the context belongs to.
    pub fn activity_thread(&self) -> &GlobalRef {
        &self.activity_thread
    }
}

/// A surface created by the helper, and its native window on Android.
#[derive(Debug)]
pub struct SurfaceHandle {
    surface: GlobalRef,
    width: i32,
    height: i32,
    #[cfg(target_os = "android")]
    window: ndk::native_window::NativeWindow,
}

impl SurfaceHandle {
    fn new(env: &mut JNIEnv<'_>, surface: GlobalRef, width: i32, height: i32) -> Result<Self> {
        #[cfg(target_os = "android")]
        let window = {
            // Safety: surface is a live android.view.Surface and env belongs to this thread
            unsafe {
                ndk::native_window::NativeWindow::from_surface(
                    env.get_raw(),
                    surface.as_obj().as_raw(),
                )
            }
            .ok_or_else(|| Error::ManagedCallFailed {
                stage: CREATE_SURFACE.to_string(),
                message: "surface has no native window".to_string(),
            })?
        };
        #[cfg(not(target_os = "android"))]
        let _ = env;

        Ok(SurfaceHandle {
            surface,
            width,
            height,
            #[cfg(target_os = "android")]
            window,
        })
    }

    /// The `android.view.Surface`.
    pub fn surface(&self) -> &GlobalRef {
        &self.surface
    }

    /// Width requested from the helper.
    pub fn width(&self) -> i32 {
        self.width
    }

    /// Height requested from the helper.
    pub fn height(&self) -> i32 {
        self.height
    }

    /// The native window backing the surface.
    #[cfg(target_os = "android")]
    pub fn window(&self) -> &ndk::native_window::NativeWindow {
        &self.window
    }
}

/// Display geometry as reported by the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayInfo {
    /// Natural panel width
    pub width: i32,
    /// Natural panel height
    pub height: i32,
    /// `Surface.ROTATION_*`, 0 to 3
    pub rotation: i32,
}

impl DisplayInfo {
    /// Size of a surface covering the display in its current rotation.
    ///
    /// The helper reports the natural panel size, so width and height trade places
    /// for rotations 0 and 180.
    pub fn surface_size(&self) -> (i32, i32) {
        if self.rotation == 0 || self.rotation == 2 {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }
}

/// Action codes of the helper's `injectTouchEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(i32)]
pub enum TouchAction {
    /// A pointer went down
    Down = 0,
    /// A pointer went up or was cancelled
    Up = 1,
    /// A pointer moved
    Move = 2,
}

impl From<TouchPhase> for TouchAction {
    fn from(phase: TouchPhase) -> Self {
        match phase {
            TouchPhase::Start => TouchAction::Down,
            TouchPhase::End | TouchPhase::Cancel => TouchAction::Up,
            TouchPhase::Move => TouchAction::Move,
        }
    }
}

/// Runs a [`BridgePlan`] against the VM registered in a [`Lifecycle`].
pub struct ContextBridge<'a> {
    plan: &'a BridgePlan,
    version: &'a PlatformVersion,
    lifecycle: &'a Lifecycle,
}

impl<'a> ContextBridge<'a> {
    /// A bridge running `plan` on `version`, once `lifecycle` is `Ready`.
    pub fn new(plan: &'a BridgePlan, version: &'a PlatformVersion, lifecycle: &'a Lifecycle) -> Self {
        ContextBridge {
            plan,
            version,
            lifecycle,
        }
    }

    /// Runs every stage in order on `env`, which must belong to the calling thread.
    ///
    /// # Errors
    /// - [`Error::NotReady`] if the runtime patch has not been confirmed
    /// - [`Error::ManagedCallFailed`] / [`Error::PendingManagedException`] naming the
    ///   stage that failed
    /// - [`Error::UnsupportedPlatformVersion`] below API 26
    /// - [`Error::Io`] if the helper dex cannot be read
    pub fn establish(&self, env: &mut JNIEnv<'_>, start_reg: StartRegFn) -> Result<BridgeSession> {
        self.lifecycle.vm()?;

        start_registration(env, start_reg)?;
        let context = self.system_context(env)?;

        let helper = &self.plan.helper;
        let dex = helper.dex.load()?;
        let class = load_class(env, &dex, &helper.class, self.version)?;

        debug!(stage = HELPER_MAIN, "calling helper main");
        guarded(env, HELPER_MAIN, |env| {
            let args = dex::empty_args(env)?;
            env.call_static_method(
                as_class(&class),
                "main",
                "([Ljava/lang/String;)V",
                &[JValue::Object(&args)],
            )?;
            Ok(())
        })?;

        let screen = guarded(env, DISPLAY_INFO, |env| {
            let array = JIntArray::from(
                env.call_static_method(as_class(&class), "getDisplayInfo", "()[I", &[])?
                    .l()?,
            );
            let mut info = [0; 3];
            env.get_int_array_region(&array, 0, &mut info)?;
            Ok(DisplayInfo {
                width: info[0],
                height: info[1],
                rotation: info[2],
            })
        })?;
        info!(
            width = screen.width,
            height = screen.height,
            rotation = screen.rotation,
            "display"
        );

        let (width, height) = screen.surface_size();
        let surface = guarded(env, CREATE_SURFACE, |env| {
            let surface = env
                .call_static_method(
                    as_class(&class),
                    "createNativeWindow",
                    "(IIZZ)Landroid/view/Surface;",
                    &[
                        JValue::Int(width),
                        JValue::Int(height),
                        JValue::Bool(helper.hidden as jboolean),
                        JValue::Bool(helper.secure as jboolean),
                    ],
                )?
                .l()?;
            if surface.is_null() {
                return Err(jni::errors::Error::NullPtr("createNativeWindow"));
            }
            env.new_global_ref(surface)
        })?;
        let surface = SurfaceHandle::new(env, surface, width, height)?;
        info!(width, height, "surface created");

        Ok(BridgeSession {
            context,
            surface,
            display: screen,
            helper: class,
        })
    }

    fn system_context(&self, env: &mut JNIEnv<'_>) -> Result<ContextHandle> {
        let plan = self.plan;

        debug!(stage = PREPARE_MAIN_LOOPER, "preparing main looper");
        guarded(env, PREPARE_MAIN_LOOPER, |env| {
            let method = &plan.prepare_main_looper;
            env.call_static_method(
                method.class.as_str(),
                method.name.as_str(),
                method.signature.as_str(),
                &[],
            )?;
            Ok(())
        })?;

        debug!(stage = SYSTEM_MAIN, "starting system activity thread");
        let activity_thread = guarded(env, SYSTEM_MAIN, |env| {
            let method = &plan.system_main;
            let thread = env
                .call_static_method(
                    method.class.as_str(),
                    method.name.as_str(),
                    method.signature.as_str(),
                    &[],
                )?
                .l()?;
            if thread.is_null() {
                return Err(jni::errors::Error::NullPtr("systemMain"));
            }
            env.new_global_ref(thread)
        })?;

        debug!(stage = SYSTEM_CONTEXT, "obtaining system context");
        let context = guarded(env, SYSTEM_CONTEXT, |env| {
            let method = &plan.system_context;
            let context = env
                .call_method(
                    activity_thread.as_obj(),
                    method.name.as_str(),
                    method.signature.as_str(),
                    &[],
                )?
                .l()?;
            if context.is_null() {
                return Err(jni::errors::Error::NullPtr("getSystemContext"));
            }
            env.new_global_ref(context)
        })?;

        Ok(ContextHandle {
            activity_thread,
            context,
        })
    }
}

/// Everything the bridge established, handed to the present loop.
#[derive(Debug)]
pub struct BridgeSession {
    context: ContextHandle,
    surface: SurfaceHandle,
    display: DisplayInfo,
    helper: GlobalRef,
}

impl BridgeSession {
    /// The system context.
    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    /// The surface to present to.
    pub fn surface(&self) -> &SurfaceHandle {
        &self.surface
    }

    /// Display geometry the surface was sized from.
    pub fn display(&self) -> DisplayInfo {
        self.display
    }

    /// Forwards a touch to the helper's `injectTouchEvent`.
    ///
    /// # Errors
    /// [`Error::ManagedCallFailed`] / [`Error::PendingManagedException`] for stage
    /// `inject_touch`. Callers usually ignore these.
    pub fn inject_touch(
        &self,
        env: &mut JNIEnv<'_>,
        action: TouchAction,
        pointer: i64,
        x: i32,
        y: i32,
    ) -> Result<()> {
        guarded(env, INJECT_TOUCH, |env| {
            env.call_static_method(
                as_class(&self.helper),
                "injectTouchEvent",
                "(IJII)V",
                &[
                    JValue::Int(action as i32),
                    JValue::Long(pointer),
                    JValue::Int(x),
                    JValue::Int(y),
                ],
            )?;
            Ok(())
        })
    }
}

fn as_class(class: &GlobalRef) -> &JClass<'static> {
    <&JClass<'static>>::from(class.as_obj())
}

fn start_registration(env: &mut JNIEnv<'_>, start_reg: StartRegFn) -> Result<()> {
    debug!(stage = START_REGISTRATION, "registering framework natives");

    // Safety: start_reg was validated against the loaded runtime module, env belongs
    // to the calling thread
    let status = unsafe { start_reg(env.get_raw()) };

    if let Some(message) = env.take_exception() {
        return Err(Error::PendingManagedException {
            stage: START_REGISTRATION.to_string(),
            message,
        });
    }
    if status != 0 {
        return Err(Error::ManagedCallFailed {
            stage: START_REGISTRATION.to_string(),
            message: format!("startReg returned {status}"),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::ffi::c_int;

    use jni::sys;

    use super::*;
    use crate::ErrorKind;

    unsafe extern "C" fn never_called(_env: *mut sys::JNIEnv) -> c_int {
        panic!("startReg must not run before the runtime is ready")
    }

    #[test]
    fn rotation_swaps_natural_size() {
        let portrait = DisplayInfo {
            width: 1080,
            height: 2400,
            rotation: 0,
        };
        assert_eq!(portrait.surface_size(), (2400, 1080));

        let upside_down = DisplayInfo {
            rotation: 2,
            ..portrait
        };
        assert_eq!(upside_down.surface_size(), (2400, 1080));

        let landscape = DisplayInfo {
            rotation: 1,
            ..portrait
        };
        assert_eq!(landscape.surface_size(), (1080, 2400));
        assert_eq!(DisplayInfo { rotation: 3, ..portrait }.surface_size(), (1080, 2400));
    }

    #[test]
    fn touch_actions() {
        assert_eq!(TouchAction::from(TouchPhase::Start) as i32, 0);
        assert_eq!(TouchAction::from(TouchPhase::End) as i32, 1);
        assert_eq!(TouchAction::from(TouchPhase::Cancel) as i32, 1);
        assert_eq!(TouchAction::from(TouchPhase::Move) as i32, 2);
        assert_eq!(TouchAction::Move.to_string(), "move");
    }

    #[test]
    fn refuses_before_patch() {
        let lifecycle = Lifecycle::new();
        let plan = BridgePlan::default().with_dex(DexSource::Bytes(Vec::new()));
        let version = PlatformVersion::new(34, "14");
        let bridge = ContextBridge::new(&plan, &version, &lifecycle);

        // never dereferenced: the lifecycle check comes first
        let mut env = unsafe { JNIEnv::from_raw(0x2000 as *mut sys::JNIEnv) }.unwrap();
        let error = bridge.establish(&mut env, never_called).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::NotReady);
    }
}
