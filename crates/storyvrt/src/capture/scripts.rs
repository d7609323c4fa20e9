//! Page-side script fragments injected over CDP.
//!
//! Templates carry `__NAME__` placeholders filled in by the callers;
//! everything else is a ready-to-eval constant.

/// Init-script template pinning the wall clock.
///
/// Replaces the global `Date` constructor and `Date.now` so every invocation
/// returns `__PINNED_TS__` (epoch milliseconds). `Date.parse` and `Date.UTC`
/// keep their native behavior.
pub(crate) const FIX_DATE_JS_TEMPLATE: &str = r#"
(function() {
    var PINNED = __PINNED_TS__;
    var NativeDate = Date;
    function FixedDate() {
        if (arguments.length === 0) {
            return new NativeDate(PINNED);
        }
        var args = Array.prototype.slice.call(arguments);
        return new (Function.prototype.bind.apply(NativeDate, [null].concat(args)))();
    }
    FixedDate.prototype = NativeDate.prototype;
    FixedDate.now = function() { return PINNED; };
    FixedDate.parse = NativeDate.parse;
    FixedDate.UTC = NativeDate.UTC;
    window.Date = FixedDate;
})();
"#;

/// CSS forcing every animation and transition to a frozen state.
///
/// Applies to all elements plus common animate/spin/fade/slide class
/// prefixes that re-assert their own timing.
pub(crate) const DISABLE_ANIMATIONS_CSS: &str = r#"
*,
*::before,
*::after {
  animation-duration: 0s !important;
  animation-delay: 0s !important;
  animation-play-state: paused !important;
  transition-duration: 0s !important;
  transition-delay: 0s !important;
  transition-property: none !important;
  scroll-behavior: auto !important;
  caret-color: transparent !important;
}
[class*="animate"],
[class*="spin"],
[class*="fade"],
[class*="slide"] {
  animation: none !important;
  transition: none !important;
  transform: none !important;
}
"#;

/// Init script installing the animation-kill style before any page script
/// runs, plus a MutationObserver that re-asserts `animation-play-state:
/// paused` on inserted element nodes.
pub(crate) const ANIMATION_INIT_JS_TEMPLATE: &str = r#"
(function() {
    var CSS = `__CSS__`;
    function inject() {
        var style = document.createElement('style');
        style.id = '__vrt-no-anim';
        style.textContent = CSS;
        (document.head || document.documentElement).appendChild(style);
    }
    if (document.readyState === 'loading') {
        document.addEventListener('DOMContentLoaded', inject);
    } else {
        inject();
    }
    var observer = new MutationObserver(function(mutations) {
        mutations.forEach(function(m) {
            m.addedNodes.forEach(function(node) {
                if (node.nodeType === 1) {
                    node.style.setProperty('animation-play-state', 'paused', 'important');
                }
            });
        });
    });
    function observe() {
        observer.observe(document.documentElement, { childList: true, subtree: true });
    }
    if (document.documentElement) {
        observe();
    } else {
        document.addEventListener('DOMContentLoaded', observe);
    }
})();
"#;

/// Post-load reinforcement: re-inject the kill style, sweep inline
/// animation/transition properties once, report zero durations from
/// `getComputedStyle`, and force-hide Storybook loader overlays.
pub(crate) const ANIMATION_REINFORCE_JS_TEMPLATE: &str = r#"
(function() {
    var CSS = `__CSS__`;
    if (!document.getElementById('__vrt-no-anim-late')) {
        var style = document.createElement('style');
        style.id = '__vrt-no-anim-late';
        style.textContent = CSS;
        document.head.appendChild(style);
    }

    var all = document.querySelectorAll('*');
    for (var i = 0; i < all.length; i++) {
        var el = all[i];
        if (el.style) {
            el.style.removeProperty('animation');
            el.style.removeProperty('transition');
        }
    }

    if (!window.__vrtComputedStylePatched) {
        window.__vrtComputedStylePatched = true;
        var native = window.getComputedStyle;
        window.getComputedStyle = function(el, pseudo) {
            var style = native.call(window, el, pseudo);
            var zeroed = ['animation-duration', 'animation-delay',
                          'transition-duration', 'transition-delay'];
            return new Proxy(style, {
                get: function(target, prop) {
                    if (typeof prop === 'string' &&
                        zeroed.indexOf(prop.replace(/([A-Z])/g, '-$1').toLowerCase()) !== -1) {
                        return '0s';
                    }
                    var value = target[prop];
                    return typeof value === 'function' ? value.bind(target) : value;
                }
            });
        };
    }

    var loaders = document.querySelectorAll(
        '.sb-preparing-story, .sb-preparing-docs, .sb-loader');
    for (var j = 0; j < loaders.length; j++) {
        loaders[j].style.setProperty('display', 'none', 'important');
        loaders[j].setAttribute('aria-hidden', 'true');
    }
})();
"#;

/// Finish or cancel in-progress Web Animations API animations. Complements
/// the CSS layer by handling JS-driven animations (framer-motion, GSAP).
/// Finite animations jump to their end state; infinite ones are cancelled.
pub(crate) const FINISH_ANIMATIONS_JS: &str = r#"
(function() {
    if (!document.getAnimations) return;
    document.getAnimations().forEach(function(a) {
        try {
            var timing = a.effect && a.effect.getComputedTiming && a.effect.getComputedTiming();
            if (timing && Number.isFinite(timing.endTime)) {
                a.finish();
            } else {
                a.cancel();
            }
        } catch(e) {}
    });
})();
"#;

/// Poll for the component-explorer root element (100ms interval,
/// `__TIMEOUT_MS__` cap). Resolves `'found'` or rejects.
pub(crate) const WAIT_FOR_ROOT_JS_TEMPLATE: &str = r#"
(function waitForRoot() {
    return new Promise(function(resolve, reject) {
        var TIMEOUT = __TIMEOUT_MS__;
        var INTERVAL = 100;
        var deadline = performance.now() + TIMEOUT;
        function check() {
            if (document.querySelector('#storybook-root')) {
                resolve('found');
                return;
            }
            if (performance.now() >= deadline) {
                reject(new Error('#storybook-root not found after ' + TIMEOUT + 'ms'));
                return;
            }
            setTimeout(check, INTERVAL);
        }
        check();
    });
})()
"#;

/// One-shot content-readiness check, shared by the fast wait and the
/// polling fallback.
///
/// The root is "ready" when it has child elements, or non-empty HTML, or
/// visible text inside a root with real dimensions, or embedded
/// canvas/SVG content.
pub(crate) const CONTENT_READY_CHECK_JS: &str = r#"
(function() {
    var root = document.querySelector('#storybook-root');
    if (!root) return false;
    var hasChildren = root.children.length > 0;
    var hasNonEmptyHTML = root.innerHTML.trim().length > 0;
    var hasText = (root.textContent || '').trim().length > 0;
    var rect = root.getBoundingClientRect();
    var hasDimensions = rect.width > 0 && rect.height > 0;
    var hasGraphics = !!root.querySelector('canvas, svg');
    return hasChildren || hasNonEmptyHTML || (hasText && hasDimensions) || hasGraphics;
})()
"#;

/// Promise-based content-readiness wait: re-checks every 50ms until the
/// predicate holds or `__TIMEOUT_MS__` elapses (then rejects).
pub(crate) const CONTENT_READY_WAIT_JS_TEMPLATE: &str = r#"
(function waitForContent() {
    return new Promise(function(resolve, reject) {
        var TIMEOUT = __TIMEOUT_MS__;
        var INTERVAL = 50;
        var deadline = performance.now() + TIMEOUT;
        function ready() {
            var root = document.querySelector('#storybook-root');
            if (!root) return false;
            var hasChildren = root.children.length > 0;
            var hasNonEmptyHTML = root.innerHTML.trim().length > 0;
            var hasText = (root.textContent || '').trim().length > 0;
            var rect = root.getBoundingClientRect();
            var hasDimensions = rect.width > 0 && rect.height > 0;
            var hasGraphics = !!root.querySelector('canvas, svg');
            return hasChildren || hasNonEmptyHTML || (hasText && hasDimensions) || hasGraphics;
        }
        function check() {
            if (ready()) {
                resolve('ready');
                return;
            }
            if (performance.now() >= deadline) {
                reject(new Error('story content not ready after ' + TIMEOUT + 'ms'));
                return;
            }
            setTimeout(check, INTERVAL);
        }
        check();
    });
})()
"#;

/// Wait for `document.fonts.ready`, capped at `__TIMEOUT_MS__`. Always
/// resolves; a late font is not a capture failure.
pub(crate) const WAIT_FONTS_JS_TEMPLATE: &str = r#"
(function waitForFonts() {
    return new Promise(function(resolve) {
        var timer = setTimeout(function() { resolve('timeout'); }, __TIMEOUT_MS__);
        document.fonts.ready.then(function() {
            clearTimeout(timer);
            resolve('ready');
        });
    });
})()
"#;

/// DOM-stability wait: resolves once no mutations are observed for
/// `__QUIET_MS__`, or unconditionally after `__MAX_MS__`.
pub(crate) const DOM_SETTLE_JS_TEMPLATE: &str = r#"
(function waitForSettle() {
    return new Promise(function(resolve) {
        var QUIET_MS = __QUIET_MS__;
        var MAX_MS = __MAX_MS__;
        var settleTimer = null;
        var observer = new MutationObserver(function() {
            if (settleTimer) clearTimeout(settleTimer);
            settleTimer = setTimeout(done, QUIET_MS);
        });
        var maxTimer = setTimeout(done, MAX_MS);
        function done() {
            clearTimeout(maxTimer);
            if (settleTimer) clearTimeout(settleTimer);
            observer.disconnect();
            resolve('settled');
        }
        observer.observe(document.documentElement, {
            childList: true,
            subtree: true,
            attributes: true,
            characterData: true,
        });
        // If the DOM is already quiet, resolve after the quiet period.
        settleTimer = setTimeout(done, QUIET_MS);
    });
})()
"#;

/// `document.readyState`, for the DOMContentLoaded polling fallback.
pub(crate) const READY_STATE_JS: &str = "document.readyState";

/// `Date.now()`, for verifying the pinned clock after navigation.
pub(crate) const DATE_NOW_JS: &str = "Date.now()";

/// JSON probe of page state for timeout/crash dumps: URL, readyState, and
/// root metrics.
pub(crate) const PAGE_STATE_JS: &str = r#"
(function() {
    var root = document.querySelector('#storybook-root');
    var rect = root ? root.getBoundingClientRect() : null;
    return JSON.stringify({
        url: location.href,
        readyState: document.readyState,
        rootPresent: !!root,
        rootChildCount: root ? root.children.length : 0,
        rootTextLength: root ? (root.textContent || '').length : 0,
        rootRect: rect ? { width: rect.width, height: rect.height } : null,
    });
})()
"#;

/// `document.documentElement.outerHTML`, for timeout/crash dumps.
pub(crate) const OUTER_HTML_JS: &str = "document.documentElement.outerHTML";

/// Escape CSS for embedding in a JS template literal.
pub(crate) fn escape_for_template_literal(css: &str) -> String {
    css.replace('\\', "\\\\")
        .replace('`', "\\`")
        .replace("${", "\\${")
}
