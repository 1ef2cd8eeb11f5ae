//! Bootstrap runner executed in place of the user's code
//!
//! The interpreter starts the runner, which lowers its own limits, installs
//! the import guard, confines the shared `os` module and `open()`, then
//! executes the user file in a restricted namespace.
//!
//! These guards live inside the interpreter the user code runs in. Only the
//! bwrap backend puts the host filesystem and network out of reach.

use std::path::{Path, PathBuf};

use crate::policy::ResourceLimits;
use crate::validate::{DENIED_BUILTINS, DENIED_MODULES, PROCESS_CALLS};

pub const RUNNER_FILE: &str = "__geoforge_runner__.py";
pub const USER_FILE: &str = "__geoforge_user__.py";

/// Exit code the runner uses for `MemoryError` and file-size overruns
pub const RESOURCE_EXIT_CODE: i32 = 86;

const USER_MODULE: &str = "__sandbox__";

const BOOTSTRAP: &str = r#"import builtins
import errno
import io
import os
import posix
import sys
import traceback
import types

USER_FILE = @USER_FILE@
USER_MODULE = @USER_MODULE@
RESOURCE_EXIT = @RESOURCE_EXIT@
WORKDIR = os.path.realpath(os.getcwd())
DENIED = frozenset(@DENIED_MODULES@)
BLOCKED_BUILTINS = frozenset(@BLOCKED_BUILTINS@)
PROCESS_CALLS = frozenset(@PROCESS_CALLS@)


def _apply_limits():
    cores = int(os.environ.get("GEOFORGE_CPU_CORES", "1"))
    cpu_seconds = int(os.environ.get("GEOFORGE_CPU_SECONDS", "0"))
    fsize = int(os.environ.get("GEOFORGE_FSIZE_BYTES", "0"))
    if hasattr(os, "sched_setaffinity"):
        try:
            allowed = sorted(os.sched_getaffinity(0))
            os.sched_setaffinity(0, allowed[:max(cores, 1)])
        except OSError:
            pass
    try:
        import resource
    except ImportError:
        return
    for limit, value in ((resource.RLIMIT_CPU, cpu_seconds), (resource.RLIMIT_FSIZE, fsize)):
        if value > 0:
            try:
                resource.setrlimit(limit, (value, value))
            except (ValueError, OSError):
                pass


_apply_limits()

import collections
import datetime
import decimal
import fractions
import functools
import itertools
import json
import math
import random
import re
import statistics

EARTH_RADIUS_KM = 6371.0088


def haversine_km(lat1, lon1, lat2, lon2):
    p1, p2 = math.radians(lat1), math.radians(lat2)
    dp = p2 - p1
    dl = math.radians(lon2 - lon1)
    a = math.sin(dp / 2) ** 2 + math.cos(p1) * math.cos(p2) * math.sin(dl / 2) ** 2
    return 2 * EARTH_RADIUS_KM * math.asin(min(1.0, math.sqrt(a)))


def initial_bearing_deg(lat1, lon1, lat2, lon2):
    p1, p2 = math.radians(lat1), math.radians(lat2)
    dl = math.radians(lon2 - lon1)
    x = math.sin(dl) * math.cos(p2)
    y = math.cos(p1) * math.sin(p2) - math.sin(p1) * math.cos(p2) * math.cos(dl)
    return (math.degrees(math.atan2(x, y)) + 360.0) % 360.0


def destination_point(lat, lon, bearing_deg, distance_km):
    d = distance_km / EARTH_RADIUS_KM
    b = math.radians(bearing_deg)
    p1, l1 = math.radians(lat), math.radians(lon)
    p2 = math.asin(math.sin(p1) * math.cos(d) + math.cos(p1) * math.sin(d) * math.cos(b))
    l2 = l1 + math.atan2(math.sin(b) * math.sin(d) * math.cos(p1), math.cos(d) - math.sin(p1) * math.sin(p2))
    return math.degrees(p2), (math.degrees(l2) + 540.0) % 360.0 - 180.0


def bounding_box(points):
    lats = [p[0] for p in points]
    lons = [p[1] for p in points]
    return min(lats), min(lons), max(lats), max(lons)


def centroid(points):
    points = list(points)
    return (
        sum(p[0] for p in points) / len(points),
        sum(p[1] for p in points) / len(points),
    )


def polygon_area_km2(ring):
    ring = list(ring)
    if len(ring) < 3:
        return 0.0
    total = 0.0
    for i, (lat1, lon1) in enumerate(ring):
        lat2, lon2 = ring[(i + 1) % len(ring)]
        total += math.radians(lon2 - lon1) * (
            2 + math.sin(math.radians(lat1)) + math.sin(math.radians(lat2))
        )
    return abs(total * EARTH_RADIUS_KM ** 2 / 2.0)


def facade(module):
    # public names only; no route back to os or sys through module attributes
    return types.SimpleNamespace(**{
        name: value
        for name, value in vars(module).items()
        if not name.startswith("_") and not isinstance(value, types.ModuleType)
    })


bindings = {
    "collections": facade(collections),
    "datetime": facade(datetime),
    "decimal": facade(decimal),
    "fractions": facade(fractions),
    "functools": facade(functools),
    "itertools": facade(itertools),
    "json": facade(json),
    "math": facade(math),
    "random": facade(random),
    "re": facade(re),
    "statistics": facade(statistics),
    "EARTH_RADIUS_KM": EARTH_RADIUS_KM,
    "haversine_km": haversine_km,
    "initial_bearing_deg": initial_bearing_deg,
    "destination_point": destination_point,
    "bounding_box": bounding_box,
    "centroid": centroid,
    "polygon_area_km2": polygon_area_km2,
}

for module_name, alias in (
    ("numpy", "np"),
    ("pandas", "pd"),
    ("shapely", "shapely"),
    ("geopandas", "gpd"),
    ("pyproj", "pyproj"),
):
    try:
        bindings[alias] = __import__(module_name)
    except Exception:
        pass

for cached in list(sys.modules):
    if cached.partition(".")[0] in DENIED and cached not in sys.builtin_module_names:
        del sys.modules[cached]
sys.modules.pop("_posixsubprocess", None)

real_import = builtins.__import__
real_open = builtins.open
real_fileio = io.FileIO


def guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    importer = (globals or {}).get("__name__")
    if level == 0 and importer in (USER_MODULE, None) and name.partition(".")[0] in DENIED:
        raise ImportError(f"import of '{name}' is not allowed in the sandbox")
    return real_import(name, globals, locals, fromlist, level)


READ_ROOTS = tuple({os.path.realpath(p) for p in sys.path if p})
WRITE_FLAGS = os.O_WRONLY | os.O_RDWR | os.O_CREAT | os.O_TRUNC | os.O_APPEND
DIR_FD_ARGS = ("dir_fd", "src_dir_fd", "dst_dir_fd")


def inside(path, root):
    return path == root or path.startswith(root.rstrip(os.sep) + os.sep)


def check_path(file, writing):
    if isinstance(file, int):
        raise PermissionError("access by file descriptor is not allowed in the sandbox")
    path = os.path.realpath(os.fsdecode(file))
    if inside(path, WORKDIR):
        return
    if writing or not any(inside(path, root) for root in READ_ROOTS):
        raise PermissionError(f"access outside the working directory is not allowed: {file}")


def confined_open(file, mode="r", *args, **kwargs):
    check_path(file, any(flag in mode for flag in "wax+"))
    return real_open(file, mode, *args, **kwargs)


class ConfinedFileIO(real_fileio):
    def __init__(self, file, mode="r", *args, **kwargs):
        check_path(file, any(flag in mode for flag in "wax+"))
        super().__init__(file, mode, *args, **kwargs)


def refused(name):
    def call(*args, **kwargs):
        raise PermissionError(f"os.{name} is not allowed in the sandbox")
    return call


def path_call(real, writing, arity):
    def call(*args, **kwargs):
        if any(kwargs.get(key) is not None for key in DIR_FD_ARGS):
            raise PermissionError("access by directory descriptor is not allowed in the sandbox")
        targets = list(args[:arity]) + [kwargs[k] for k in ("path", "src", "dst") if k in kwargs]
        for target in targets or ["."]:
            check_path("." if target is None else target, writing)
        return real(*args, **kwargs)
    return call


def confined_os_open(path, flags, *args, **kwargs):
    if any(kwargs.get(key) is not None for key in DIR_FD_ARGS):
        raise PermissionError("access by directory descriptor is not allowed in the sandbox")
    check_path(path, bool(flags & WRITE_FLAGS))
    return real_os_open(path, flags, *args, **kwargs)


real_os_open = posix.open
PATH_CALLS = {
    "listdir": (False, 1),
    "scandir": (False, 1),
    "chdir": (False, 1),
    "remove": (True, 1),
    "unlink": (True, 1),
    "rmdir": (True, 1),
    "mkdir": (True, 1),
    "mkfifo": (True, 1),
    "mknod": (True, 1),
    "chmod": (True, 1),
    "chown": (True, 1),
    "lchown": (True, 1),
    "truncate": (True, 1),
    "utime": (True, 1),
    "chroot": (True, 1),
    "rename": (True, 2),
    "replace": (True, 2),
    "link": (True, 2),
    "symlink": (True, 2),
}


def confine_os():
    # os and posix are shared by every module, so references reached any
    # other way see the same replacements
    for module in (posix, os):
        for name in dir(module):
            if name.startswith(("exec", "spawn")) or name in PROCESS_CALLS:
                setattr(module, name, refused(name))
        for name, (writing, arity) in PATH_CALLS.items():
            real = getattr(posix, name, None)
            if real is not None:
                setattr(module, name, path_call(real, writing, arity))
        module.open = confined_os_open
        for name in ("fchdir", "fdopen", "popen"):
            if hasattr(module, name):
                setattr(module, name, refused(name))


confine_os()
builtins.open = confined_open
io.open = confined_open
io.FileIO = ConfinedFileIO

safe_builtins = {k: v for k, v in vars(builtins).items() if k not in BLOCKED_BUILTINS}
safe_builtins["__import__"] = guarded_import
safe_builtins["open"] = confined_open

namespace = {"__name__": USER_MODULE, "__file__": USER_FILE, "__builtins__": safe_builtins}
namespace.update(bindings)

with real_open(USER_FILE, "r", encoding="utf-8") as handle:
    program = compile(handle.read(), USER_FILE, "exec")

try:
    exec(program, namespace)
except SystemExit:
    raise
except MemoryError as error:
    traceback.print_exception(type(error), error, error.__traceback__.tb_next)
    sys.exit(RESOURCE_EXIT)
except BaseException as error:
    traceback.print_exception(type(error), error, error.__traceback__.tb_next)
    if isinstance(error, OSError) and error.errno == errno.EFBIG:
        sys.exit(RESOURCE_EXIT)
    sys.exit(1)
"#;

fn python_str(value: &str) -> String {
    format!("\"{value}\"")
}

fn python_set(values: impl Iterator<Item = &'static str>) -> String {
    let items: Vec<String> = values.map(python_str).collect();
    format!("{{{}}}", items.join(", "))
}

/// Runner source with the deny lists filled in
pub fn bootstrap_source() -> String {
    // `__import__` is replaced by the guard rather than removed
    let blocked = DENIED_BUILTINS
        .iter()
        .copied()
        .filter(|name| !name.starts_with("__"));

    BOOTSTRAP
        .replace("@USER_FILE@", &python_str(USER_FILE))
        .replace("@USER_MODULE@", &python_str(USER_MODULE))
        .replace("@RESOURCE_EXIT@", &RESOURCE_EXIT_CODE.to_string())
        .replace("@DENIED_MODULES@", &python_set(DENIED_MODULES.iter().copied()))
        .replace("@BLOCKED_BUILTINS@", &python_set(blocked))
        .replace("@PROCESS_CALLS@", &python_set(PROCESS_CALLS.iter().copied()))
}

/// Files the sandbox writes itself; never reported as artifacts
pub fn is_runner_file(name: &str) -> bool {
    name == RUNNER_FILE || name == USER_FILE
}

/// Write the runner and the user code into `dir`; returns the runner path
pub async fn prepare(dir: &Path, code: &str) -> std::io::Result<PathBuf> {
    let runner = dir.join(RUNNER_FILE);
    tokio::fs::write(&runner, bootstrap_source()).await?;
    tokio::fs::write(dir.join(USER_FILE), code).await?;
    Ok(runner)
}

/// Environment of the interpreter; nothing is inherited from the host
pub fn environment(limits: &ResourceLimits, workdir: &Path) -> Vec<(&'static str, String)> {
    let workdir = workdir.display().to_string();
    vec![
        ("PATH", "/usr/local/bin:/usr/bin:/bin".to_string()),
        ("LANG", "C.UTF-8".to_string()),
        ("LC_ALL", "C.UTF-8".to_string()),
        ("HOME", workdir.clone()),
        ("TMPDIR", workdir.clone()),
        ("MPLBACKEND", "Agg".to_string()),
        ("MPLCONFIGDIR", workdir),
        ("GEOFORGE_CPU_CORES", limits.cpu_cores.to_string()),
        ("GEOFORGE_CPU_SECONDS", limits.cpu_seconds().to_string()),
        ("GEOFORGE_FSIZE_BYTES", limits.memory_bytes().to_string()),
    ]
}
